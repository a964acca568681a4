//! Install: fund a new app from the free balance.

use crate::error::MachineResult;
use crate::ethereum::InstallCommitment;
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::models::AppInstance;
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

/// The proposal instantiated at the channel's next sequence number.
fn propose(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install()?;
    let channel = run_channel(ctx, &params.multisig_address)?;

    let app_seq_no = channel.next_app_seq_no();
    let app = AppInstance::from_proposal(
        &params.proposal,
        params.multisig_address,
        channel.signing_keys_for(app_seq_no)?,
        app_seq_no,
        channel.root_nonce_value(),
        false,
    );
    let deposit = params.alice_balance_decrement == 0
        && params.bob_balance_decrement == 0
        && app.app_interface.addr == ctx.network.eth_balance_refund;
    let next = if deposit {
        channel.install_deposit(&ctx.network, app.clone())?
    } else {
        channel.install_app(
            app.clone(),
            params.alice_balance_decrement,
            params.bob_balance_decrement,
        )?
    };
    let commitment = InstallCommitment::new(
        &ctx.network,
        params.multisig_address,
        next.multisig_owners(),
        next.free_balance()?,
        &app,
    )?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(commitment, 0))
        .with_channel(next))
}
