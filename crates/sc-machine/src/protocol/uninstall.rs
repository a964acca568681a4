//! Uninstall: remove an app and credit its payout to the free balance.

use crate::error::MachineResult;
use crate::ethereum::UninstallCommitment;
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::protocol::validator::{
    respond_signature_seq2, run_channel, send_signature_seq1, verify_initiator_signature,
    verify_responder_signature,
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

fn propose(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_uninstall()?;
    let channel = run_channel(ctx, &params.multisig_address)?;
    let app_seq_no = channel.app_instance(&params.app_identity_hash)?.app_seq_no;
    let next = channel.uninstall_app(
        &params.app_identity_hash,
        params.alice_balance_increment,
        params.bob_balance_increment,
    )?;
    let commitment = UninstallCommitment::new(
        &ctx.network,
        params.multisig_address,
        next.multisig_owners(),
        next.free_balance()?,
        app_seq_no,
    )?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(commitment, 0))
        .with_channel(next))
}
