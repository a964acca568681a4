//! Setup: install the free balance of a fresh channel.

use crate::error::MachineResult;
use crate::ethereum::SetupCommitment;
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::models::StateChannel;
use crate::protocol::validator::{
    respond_signature_seq2, send_signature_seq1, verify_initiator_signature, verify_responder_signature,
};
use crate::protocol::ProtocolStep::{self, *};

pub const INITIATOR: &[ProtocolStep] = &[
    Compute(propose),
    Sign,
    Compute(send_signature_seq1),
    SendAndWait { seq: 2 },
    Compute(verify_responder_signature),
    Commit,
];

pub const RESPONDER: &[ProtocolStep] = &[
    Compute(propose),
    Compute(verify_initiator_signature),
    Sign,
    Compute(respond_signature_seq2),
    Send,
    Commit,
];

/// Free balance at zero for both owners, funded later by deposits.
fn propose(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_setup()?;
    let timeout = ctx.config.free_balance_default_timeout;
    let channel = match ctx.state_channels.get(&params.multisig_address) {
        Some(existing) => existing.setup(&ctx.network, timeout)?,
        None => StateChannel::setup_channel(
            &ctx.network,
            params.multisig_address,
            &[params.initiating_xpub, params.responding_xpub],
            timeout,
        )?,
    };
    let commitment = SetupCommitment::new(
        &ctx.network,
        params.multisig_address,
        channel.multisig_owners(),
        channel.free_balance()?,
    )?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(commitment, 0))
        .with_channel(channel))
}
