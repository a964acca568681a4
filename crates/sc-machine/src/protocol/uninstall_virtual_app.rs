//! UninstallVirtualApp: settle a virtual app and release both legs.
//!
//! The app is first locked at its final state: all three nodes sign a
//! virtual set-state at the nonce expiry, after which no later update can
//! supersede it. The agreements in both legs are then uninstalled, crediting
//! the payouts to the leg owners.
//!
//! ```text
//! A (initiator)          I (intermediary)          B (responder)
//!   ── 1: lock ──────────▶
//!                          ── 2: lock(A), I ───────────▶
//!                          ◀── 3: lock ─────────────────
//!   ◀── 4: lock(B), I, left uninstall ──
//!   ── 5: left uninstall ▶
//!                          ── 6: right uninstall ──────▶
//!                          ◀── 7: right uninstall ──────
//! ```

use sc_crypto::{xkey_kth_address, ExtendedPublicKey, Signature};

use crate::error::{MachineError, MachineResult};
use crate::ethereum::{UninstallCommitment, VirtualAppSetStateCommitment};
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::models::{channel_between, AppInstance, StateChannel};
use crate::protocol::validator::{
    counter_signature, expect_sender, forward, intermediary_counter_signature, validate_signature,
};
use crate::protocol::{ProtocolStep::{self, *}, UninstallVirtualAppParams};

pub const INITIATOR: &[ProtocolStep] = &[
    Compute(party_lock),
    Sign,
    Compute(send_lock_to_intermediary),
    SendAndWait { seq: 4 },
    Compute(verify_lock_and_left_uninstall),
    Sign,
    Compute(send_left_uninstall),
    Send,
    Commit,
];

pub const INTERMEDIARY: &[ProtocolStep] = &[
    Compute(intermediary_lock),
    Compute(verify_initiator_lock),
    SignAsIntermediary,
    Compute(forward_lock_to_responder),
    SendAndWait { seq: 3 },
    Compute(verify_responder_lock_and_uninstall_legs),
    Sign,
    Compute(send_left_uninstall_to_initiator),
    SendAndWait { seq: 5 },
    Compute(verify_left_uninstall_and_send_right),
    SendAndWait { seq: 7 },
    Compute(verify_right_uninstall),
    Commit,
];

pub const RESPONDER: &[ProtocolStep] = &[
    Compute(party_lock),
    Compute(verify_forwarded_lock),
    Sign,
    Compute(send_lock_to_intermediary_seq3),
    SendAndWait { seq: 6 },
    Compute(verify_right_uninstall_from_intermediary),
    Sign,
    Compute(send_right_uninstall),
    Send,
    Commit,
];

const LOCK_SLOT: usize = 0;
/// A and B: their leg's agreement uninstall.
const LEG_SLOT: usize = 1;
/// I: the two legs' agreement uninstalls.
const LEFT_SLOT: usize = 1;
const RIGHT_SLOT: usize = 2;

// ============================================================================
// Shared construction
// ============================================================================

fn params(ctx: &Context) -> MachineResult<&UninstallVirtualAppParams> {
    ctx.params().as_uninstall_virtual_app()
}

/// The virtual channel with the target app locked at its final state.
fn locked_app(ctx: &Context) -> MachineResult<(StateChannel, AppInstance)> {
    let params = params(ctx)?;
    let address = ctx.params().multisig_address()?;
    let target = &params.target_app_identity_hash;
    let next = ctx
        .channel(&address)?
        .set_state(target, params.target_app_state.clone(), None)?
        .lock_app_instance(target, ctx.config.nonce_expiry)?;
    let app = next.app_instance(target)?.clone();
    Ok((next, app))
}

fn lock_commitment(ctx: &Context, app: &AppInstance) -> MachineResult<VirtualAppSetStateCommitment> {
    VirtualAppSetStateCommitment::new(
        &ctx.network,
        app,
        params(ctx)?.intermediary_xpub.owner_address()?,
        ctx.config.nonce_expiry,
    )
}

/// Sequence number of the target app, which its signing keys derive from.
fn target_seq_no(ctx: &Context) -> MachineResult<u64> {
    let params = params(ctx)?;
    let address = ctx.params().multisig_address()?;
    Ok(ctx
        .channel(&address)?
        .app_instance(&params.target_app_identity_hash)?
        .app_seq_no)
}

/// The virtual channel without the target app.
fn removed(ctx: &Context) -> MachineResult<StateChannel> {
    let params = params(ctx)?;
    let address = ctx.params().multisig_address()?;
    ctx.channel(&address)?
        .remove_virtual_app(&params.target_app_identity_hash)
}

/// Uninstall the agreement backing the target app in the leg between
/// `party` and the intermediary.
fn leg_uninstall(
    ctx: &Context,
    party: &ExtendedPublicKey,
    party_increment: u128,
    intermediary_increment: u128,
) -> MachineResult<(StateChannel, UninstallCommitment)> {
    let params = params(ctx)?;
    let leg = channel_between(&ctx.state_channels, party, &params.intermediary_xpub).ok_or_else(|| {
        MachineError::violation(ctx.protocol(), "no channel between party and intermediary")
    })?;
    let agreement = leg.agreement_for(&params.target_app_identity_hash)?;

    let (alice_party, bob_party) = leg.split_for_owner(&party.owner_address()?, party_increment)?;
    let (alice_mid, bob_mid) =
        leg.split_for_owner(&params.intermediary_xpub.owner_address()?, intermediary_increment)?;
    let next = leg.uninstall_eth_virtual_app_agreement_instance(
        &params.target_app_identity_hash,
        alice_party + alice_mid,
        bob_party + bob_mid,
    )?;
    let commitment = UninstallCommitment::new(
        &ctx.network,
        next.multisig_address(),
        next.multisig_owners(),
        next.free_balance()?,
        agreement.app_seq_no,
    )?;
    Ok((next, commitment))
}

fn left_uninstall(ctx: &Context) -> MachineResult<(StateChannel, UninstallCommitment)> {
    let params = params(ctx)?;
    leg_uninstall(
        ctx,
        &params.initiating_xpub,
        params.initiating_balance_increment,
        params.responding_balance_increment,
    )
}

fn right_uninstall(ctx: &Context) -> MachineResult<(StateChannel, UninstallCommitment)> {
    let params = params(ctx)?;
    leg_uninstall(
        ctx,
        &params.responding_xpub,
        params.responding_balance_increment,
        params.initiating_balance_increment,
    )
}

/// A leg uninstall already signed by the intermediary, as the party sees it.
fn countersigned_leg(
    ctx: &Context,
    (leg, commitment): (StateChannel, UninstallCommitment),
    signature: Option<Signature>,
) -> MachineResult<StepOutput> {
    let intermediary = params(ctx)?.intermediary_xpub.owner_address()?;
    validate_signature(&intermediary, Some(&commitment), signature.as_ref())?;
    let signature =
        signature.ok_or_else(|| MachineError::MissingSignature("leg uninstall".into()))?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(commitment, 0).with_counter_signature(signature))
        .with_channel(leg)
        .with_channel(removed(ctx)?))
}

// ============================================================================
// Parties
// ============================================================================

fn party_lock(ctx: &Context) -> MachineResult<StepOutput> {
    let (virtual_channel, app) = locked_app(ctx)?;
    let commitment = lock_commitment(ctx, &app)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(commitment, app.app_seq_no).with_required_signatures(3))
        .with_channel(virtual_channel))
}

fn send_lock_to_intermediary(ctx: &Context) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(LOCK_SLOT)?;
    Ok(forward(ctx, &params(ctx)?.intermediary_xpub, 1, [Some(signature), None, None]))
}

fn verify_lock_and_left_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let params = params(ctx)?;
    let reply = ctx.received()?;
    expect_sender(ctx, reply, &params.intermediary_xpub)?;
    let responder = xkey_kth_address(&params.responding_xpub, target_seq_no(ctx)?)?;
    let intermediary = params.intermediary_xpub.owner_address()?;
    let (lock, lock_sig) = counter_signature(ctx, LOCK_SLOT, &responder, reply.signature)?;
    let (_, intermediary_sig) = intermediary_counter_signature(ctx, LOCK_SLOT, &intermediary, reply.signature2)?;

    let leg = countersigned_leg(ctx, left_uninstall(ctx)?, reply.signature3)?;
    Ok(StepOutput::new()
        .with_counter_signature(lock, lock_sig)
        .with_counter_signature(lock, intermediary_sig)
        .merge(leg))
}

fn send_left_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(LEG_SLOT)?;
    Ok(forward(ctx, &params(ctx)?.intermediary_xpub, 5, [Some(signature), None, None]))
}

fn verify_forwarded_lock(ctx: &Context) -> MachineResult<StepOutput> {
    let params = params(ctx)?;
    expect_sender(ctx, &ctx.message, &params.intermediary_xpub)?;
    let initiator = xkey_kth_address(&params.initiating_xpub, target_seq_no(ctx)?)?;
    let intermediary = params.intermediary_xpub.owner_address()?;
    let (lock, lock_sig) = counter_signature(ctx, LOCK_SLOT, &initiator, ctx.message.signature)?;
    let (_, intermediary_sig) =
        intermediary_counter_signature(ctx, LOCK_SLOT, &intermediary, ctx.message.signature2)?;
    Ok(StepOutput::new()
        .with_counter_signature(lock, lock_sig)
        .with_counter_signature(lock, intermediary_sig))
}

fn send_lock_to_intermediary_seq3(ctx: &Context) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(LOCK_SLOT)?;
    Ok(forward(ctx, &params(ctx)?.intermediary_xpub, 3, [Some(signature), None, None]))
}

fn verify_right_uninstall_from_intermediary(ctx: &Context) -> MachineResult<StepOutput> {
    let message = ctx.received()?;
    expect_sender(ctx, message, &params(ctx)?.intermediary_xpub)?;
    countersigned_leg(ctx, right_uninstall(ctx)?, message.signature)
}

fn send_right_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(LEG_SLOT)?;
    Ok(forward(ctx, &params(ctx)?.intermediary_xpub, 7, [Some(signature), None, None]))
}

// ============================================================================
// Intermediary
// ============================================================================

fn intermediary_lock(ctx: &Context) -> MachineResult<StepOutput> {
    let (virtual_channel, app) = locked_app(ctx)?;
    let commitment = lock_commitment(ctx, &app)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::intermediary(commitment, 0))
        .with_channel(virtual_channel))
}

fn verify_initiator_lock(ctx: &Context) -> MachineResult<StepOutput> {
    let params = params(ctx)?;
    expect_sender(ctx, &ctx.message, &params.initiating_xpub)?;
    let initiator = xkey_kth_address(&params.initiating_xpub, target_seq_no(ctx)?)?;
    let (lock, lock_sig) = counter_signature(ctx, LOCK_SLOT, &initiator, ctx.message.signature)?;
    Ok(StepOutput::new().with_counter_signature(lock, lock_sig))
}

fn forward_lock_to_responder(ctx: &Context) -> MachineResult<StepOutput> {
    let signatures = [ctx.message.signature, Some(ctx.my_signature(LOCK_SLOT)?), None];
    Ok(forward(ctx, &params(ctx)?.responding_xpub, 2, signatures))
}

fn verify_responder_lock_and_uninstall_legs(ctx: &Context) -> MachineResult<StepOutput> {
    let params = params(ctx)?;
    let reply = ctx.received()?;
    expect_sender(ctx, reply, &params.responding_xpub)?;
    let responder = xkey_kth_address(&params.responding_xpub, target_seq_no(ctx)?)?;
    let (lock, lock_sig) = counter_signature(ctx, LOCK_SLOT, &responder, reply.signature)?;

    let (left, left_commitment) = left_uninstall(ctx)?;
    let (right, right_commitment) = right_uninstall(ctx)?;
    Ok(StepOutput::new()
        .with_counter_signature(lock, lock_sig)
        .with_commitment(CommitmentSlot::local(left_commitment, 0))
        .with_commitment(CommitmentSlot::local(right_commitment, 0))
        .with_channel(left)
        .with_channel(right)
        .with_channel(removed(ctx)?))
}

fn send_left_uninstall_to_initiator(ctx: &Context) -> MachineResult<StepOutput> {
    let responder_lock = ctx.received()?.signature;
    let signatures = [
        responder_lock,
        Some(ctx.my_signature(LOCK_SLOT)?),
        Some(ctx.my_signature(LEFT_SLOT)?),
    ];
    Ok(forward(ctx, &params(ctx)?.initiating_xpub, 4, signatures))
}

fn verify_left_uninstall_and_send_right(ctx: &Context) -> MachineResult<StepOutput> {
    let params = params(ctx)?;
    let message = ctx.received()?;
    expect_sender(ctx, message, &params.initiating_xpub)?;
    let initiator = params.initiating_xpub.owner_address()?;
    let (left, left_sig) = counter_signature(ctx, LEFT_SLOT, &initiator, message.signature)?;
    let right_sig = ctx.my_signature(RIGHT_SLOT)?;
    Ok(StepOutput::new()
        .with_counter_signature(left, left_sig)
        .merge(forward(ctx, &params.responding_xpub, 6, [Some(right_sig), None, None])))
}

fn verify_right_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let params = params(ctx)?;
    let message = ctx.received()?;
    expect_sender(ctx, message, &params.responding_xpub)?;
    let responder = params.responding_xpub.owner_address()?;
    let (right, right_sig) = counter_signature(ctx, RIGHT_SLOT, &responder, message.signature)?;
    Ok(StepOutput::new().with_counter_signature(right, right_sig))
}
