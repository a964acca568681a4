//! Update: move an app to a state both parties agreed on.

use sc_crypto::H256;

use crate::error::MachineResult;
use crate::ethereum::SetStateCommitment;
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::models::StateChannel;
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
    let params = ctx.params().as_update()?;
    let channel = run_channel(ctx, &params.multisig_address)?;
    let next = channel.set_state(&params.app_identity_hash, params.new_state.clone(), None)?;
    set_state_output(ctx, next, &params.app_identity_hash)
}

/// Set-state commitment on the app's latest state in `channel`, signed with
/// the app's own key index.
pub(crate) fn set_state_output(
    ctx: &Context,
    channel: StateChannel,
    app_id: &H256,
) -> MachineResult<StepOutput> {
    let app = channel.app_instance(app_id)?;
    let commitment = SetStateCommitment::for_app(&ctx.network, app)?;
    let slot = CommitmentSlot::local(commitment, app.app_seq_no);
    Ok(StepOutput::new().with_commitment(slot).with_channel(channel))
}
