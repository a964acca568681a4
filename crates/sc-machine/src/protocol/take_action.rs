//! TakeAction: advance an app by an action instead of an explicit state.
//!
//! Both parties run the app's transition themselves through [`AppLogic`]
//! and sign the resulting set-state commitment, so a party that computes a
//! different state fails signature validation.
//!
//! [`AppLogic`]: crate::services::AppLogic

use crate::error::{MachineError, MachineResult};
use crate::executor::{Context, StepOutput};
use crate::protocol::update::set_state_output;
use crate::protocol::validator::{
    respond_signature_seq2, run_channel, send_signature_seq1, verify_initiator_signature,
    verify_responder_signature,
};
use crate::protocol::ProtocolStep::{self, *};

pub const INITIATOR: &[ProtocolStep] = &[
    Compute(apply_action),
    Sign,
    Compute(send_signature_seq1),
    SendAndWait { seq: 2 },
    Compute(verify_responder_signature),
    Commit,
];

pub const RESPONDER: &[ProtocolStep] = &[
    Compute(apply_action),
    Compute(verify_initiator_signature),
    Sign,
    Compute(respond_signature_seq2),
    Send,
    Commit,
];

fn apply_action(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_take_action()?;
    let logic = ctx
        .app_logic
        .as_ref()
        .ok_or_else(|| MachineError::violation(ctx.protocol(), "no app logic configured"))?;
    let channel = run_channel(ctx, &params.multisig_address)?;
    let app = channel.app_instance(&params.app_identity_hash)?;
    let new_state = logic.apply_action(app, &params.action)?;
    let next = channel.set_state(&params.app_identity_hash, new_state, None)?;
    set_state_output(ctx, next, &params.app_identity_hash)
}
