//! InstallVirtualApp: an app between two parties through an intermediary.
//!
//! Each party has a channel (a leg) with the intermediary. Both legs lock
//! collateral in an agreement instance backing the virtual app, and all
//! three nodes add the app to the virtual channel between the two parties.
//!
//! ```text
//! A (initiator)          I (intermediary)          B (responder)
//!   ── 1: left agreement, app ──▶
//!                          ── 2: right agreement, app(A), I ──▶
//!                          ◀── 3: right agreement, app ───────
//!   ◀── 4: left agreement, app(B), I ──
//! ```
//!
//! The initiator funds `initiating_balance_decrement` in the left leg and
//! the intermediary matches the responder's share there; in the right leg
//! the intermediary matches the initiator's share.

use sc_crypto::{xkey_kth_address, ExtendedPublicKey};

use crate::error::{MachineError, MachineResult};
use crate::ethereum::{EthVirtualAppAgreementCommitment, VirtualAppSetStateCommitment};
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::models::{channel_between, AppInstance, EthVirtualAppAgreementInstance, StateChannel};
use crate::protocol::validator::{counter_signature, expect_sender, forward, intermediary_counter_signature};
use crate::protocol::{InstallVirtualAppParams, ProtocolStep::{self, *}};

pub const INITIATOR: &[ProtocolStep] = &[
    Compute(initiator_propose),
    Sign,
    Compute(send_to_intermediary),
    SendAndWait { seq: 4 },
    Compute(verify_intermediary_reply),
    Commit,
];

pub const INTERMEDIARY: &[ProtocolStep] = &[
    Compute(intermediary_propose),
    Compute(verify_initiator_signatures),
    Sign,
    SignAsIntermediary,
    Compute(forward_to_responder),
    SendAndWait { seq: 3 },
    Compute(verify_responder_signatures),
    Compute(reply_to_initiator),
    Send,
    Commit,
];

pub const RESPONDER: &[ProtocolStep] = &[
    Compute(responder_propose),
    Compute(verify_intermediary_signatures),
    Sign,
    Compute(reply_to_intermediary),
    Send,
    Commit,
];

// Slots of the parties: their leg's agreement, then the app set-state.
const AGREEMENT_SLOT: usize = 0;
const APP_SLOT: usize = 1;

// Slots of the intermediary.
const LEFT_SLOT: usize = 0;
const RIGHT_SLOT: usize = 1;
const INTERMEDIARY_APP_SLOT: usize = 2;

// ============================================================================
// Shared construction
// ============================================================================

/// The virtual channel with the new app installed, and the app.
fn virtual_app(ctx: &Context, params: &InstallVirtualAppParams) -> MachineResult<(StateChannel, AppInstance)> {
    let address = ctx.params().multisig_address()?;
    let channel = match ctx.state_channels.get(&address) {
        Some(existing) => existing.clone(),
        None => StateChannel::new(address, &[params.initiating_xpub, params.responding_xpub])?,
    };
    let app_seq_no = channel.next_app_seq_no();
    let app = AppInstance::from_proposal(
        &params.proposal,
        address,
        channel.signing_keys_for(app_seq_no)?,
        app_seq_no,
        channel.root_nonce_value(),
        true,
    );
    let next = channel.install_virtual_app(app.clone())?;
    Ok((next, app))
}

/// Install the agreement backing `app` in the leg between `party` and the
/// intermediary.
fn leg_agreement(
    ctx: &Context,
    params: &InstallVirtualAppParams,
    app: &AppInstance,
    party: &ExtendedPublicKey,
    party_decrement: u128,
    intermediary_decrement: u128,
) -> MachineResult<(StateChannel, EthVirtualAppAgreementCommitment)> {
    let leg = channel_between(&ctx.state_channels, party, &params.intermediary_xpub).ok_or_else(|| {
        MachineError::violation(ctx.protocol(), "no channel between party and intermediary")
    })?;

    let mut beneficiaries = vec![
        params.initiating_xpub.owner_address()?,
        params.responding_xpub.owner_address()?,
    ];
    beneficiaries.sort();
    let agreement = EthVirtualAppAgreementInstance {
        multisig_address: leg.multisig_address(),
        terms: params.proposal.terms.clone(),
        app_seq_no: leg.next_app_seq_no(),
        root_nonce_value: leg.root_nonce_value(),
        expiry: params.expiry,
        capital_provided: params
            .initiating_balance_decrement
            .checked_add(params.responding_balance_decrement)
            .ok_or(MachineError::BalanceOverflow)?,
        beneficiaries,
        target_app_identity_hash: app.identity_hash()?,
    };

    let (alice_party, bob_party) = leg.split_for_owner(&party.owner_address()?, party_decrement)?;
    let (alice_mid, bob_mid) =
        leg.split_for_owner(&params.intermediary_xpub.owner_address()?, intermediary_decrement)?;
    let next = leg.install_eth_virtual_app_agreement_instance(
        agreement.clone(),
        alice_party + alice_mid,
        bob_party + bob_mid,
    )?;
    let commitment = EthVirtualAppAgreementCommitment::new(
        &ctx.network,
        next.multisig_address(),
        next.multisig_owners(),
        next.free_balance()?,
        &agreement,
    )?;
    Ok((next, commitment))
}

fn left_leg(
    ctx: &Context,
    params: &InstallVirtualAppParams,
    app: &AppInstance,
) -> MachineResult<(StateChannel, EthVirtualAppAgreementCommitment)> {
    leg_agreement(
        ctx,
        params,
        app,
        &params.initiating_xpub,
        params.initiating_balance_decrement,
        params.responding_balance_decrement,
    )
}

fn right_leg(
    ctx: &Context,
    params: &InstallVirtualAppParams,
    app: &AppInstance,
) -> MachineResult<(StateChannel, EthVirtualAppAgreementCommitment)> {
    leg_agreement(
        ctx,
        params,
        app,
        &params.responding_xpub,
        params.responding_balance_decrement,
        params.initiating_balance_decrement,
    )
}

fn app_set_state(
    ctx: &Context,
    params: &InstallVirtualAppParams,
    app: &AppInstance,
) -> MachineResult<VirtualAppSetStateCommitment> {
    VirtualAppSetStateCommitment::new(
        &ctx.network,
        app,
        params.intermediary_xpub.owner_address()?,
        ctx.config.nonce_expiry,
    )
}

/// Sequence number of the app installed by this run.
fn installed_app_seq_no(ctx: &Context) -> MachineResult<u64> {
    let address = ctx.params().multisig_address()?;
    Ok(ctx.channel(&address)?.num_installed_apps())
}

// ============================================================================
// Initiator
// ============================================================================

fn initiator_propose(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let (virtual_channel, app) = virtual_app(ctx, params)?;
    let (left, agreement) = left_leg(ctx, params, &app)?;
    let set_state = app_set_state(ctx, params, &app)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(agreement, 0))
        .with_commitment(CommitmentSlot::local(set_state, app.app_seq_no).with_required_signatures(3))
        .with_channel(left)
        .with_channel(virtual_channel))
}

fn send_to_intermediary(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let signatures = [
        Some(ctx.my_signature(AGREEMENT_SLOT)?),
        Some(ctx.my_signature(APP_SLOT)?),
        None,
    ];
    Ok(forward(ctx, &params.intermediary_xpub, 1, signatures))
}

fn verify_intermediary_reply(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let reply = ctx.received()?;
    expect_sender(ctx, reply, &params.intermediary_xpub)?;

    let intermediary = params.intermediary_xpub.owner_address()?;
    let responder = xkey_kth_address(&params.responding_xpub, installed_app_seq_no(ctx)?)?;
    let (agreement, agreement_sig) = counter_signature(ctx, AGREEMENT_SLOT, &intermediary, reply.signature)?;
    let (app, app_sig) = counter_signature(ctx, APP_SLOT, &responder, reply.signature2)?;
    let (_, intermediary_sig) = intermediary_counter_signature(ctx, APP_SLOT, &intermediary, reply.signature3)?;
    Ok(StepOutput::new()
        .with_counter_signature(agreement, agreement_sig)
        .with_counter_signature(app, app_sig)
        .with_counter_signature(app, intermediary_sig))
}

// ============================================================================
// Intermediary
// ============================================================================

fn intermediary_propose(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let (virtual_channel, app) = virtual_app(ctx, params)?;
    let (left, left_agreement) = left_leg(ctx, params, &app)?;
    let (right, right_agreement) = right_leg(ctx, params, &app)?;
    let set_state = app_set_state(ctx, params, &app)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(left_agreement, 0))
        .with_commitment(CommitmentSlot::local(right_agreement, 0))
        .with_commitment(CommitmentSlot::intermediary(set_state, 0))
        .with_channel(left)
        .with_channel(right)
        .with_channel(virtual_channel))
}

fn verify_initiator_signatures(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    expect_sender(ctx, &ctx.message, &params.initiating_xpub)?;
    let initiator = params.initiating_xpub.owner_address()?;
    let initiator_app = xkey_kth_address(&params.initiating_xpub, installed_app_seq_no(ctx)?)?;
    let (left, left_sig) = counter_signature(ctx, LEFT_SLOT, &initiator, ctx.message.signature)?;
    let (app, app_sig) = counter_signature(ctx, INTERMEDIARY_APP_SLOT, &initiator_app, ctx.message.signature2)?;
    Ok(StepOutput::new()
        .with_counter_signature(left, left_sig)
        .with_counter_signature(app, app_sig))
}

fn forward_to_responder(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let signatures = [
        Some(ctx.my_signature(RIGHT_SLOT)?),
        ctx.message.signature2,
        Some(ctx.my_signature(INTERMEDIARY_APP_SLOT)?),
    ];
    Ok(forward(ctx, &params.responding_xpub, 2, signatures))
}

fn verify_responder_signatures(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let reply = ctx.received()?;
    expect_sender(ctx, reply, &params.responding_xpub)?;
    let responder = params.responding_xpub.owner_address()?;
    let responder_app = xkey_kth_address(&params.responding_xpub, installed_app_seq_no(ctx)?)?;
    let (right, right_sig) = counter_signature(ctx, RIGHT_SLOT, &responder, reply.signature)?;
    let (app, app_sig) = counter_signature(ctx, INTERMEDIARY_APP_SLOT, &responder_app, reply.signature2)?;
    Ok(StepOutput::new()
        .with_counter_signature(right, right_sig)
        .with_counter_signature(app, app_sig))
}

fn reply_to_initiator(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let responder_app_sig = ctx.received()?.signature2;
    let signatures = [
        Some(ctx.my_signature(LEFT_SLOT)?),
        responder_app_sig,
        Some(ctx.my_signature(INTERMEDIARY_APP_SLOT)?),
    ];
    Ok(forward(ctx, &params.initiating_xpub, 4, signatures))
}

// ============================================================================
// Responder
// ============================================================================

fn responder_propose(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let (virtual_channel, app) = virtual_app(ctx, params)?;
    let (right, agreement) = right_leg(ctx, params, &app)?;
    let set_state = app_set_state(ctx, params, &app)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(agreement, 0))
        .with_commitment(CommitmentSlot::local(set_state, app.app_seq_no).with_required_signatures(3))
        .with_channel(right)
        .with_channel(virtual_channel))
}

fn verify_intermediary_signatures(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    expect_sender(ctx, &ctx.message, &params.intermediary_xpub)?;
    let intermediary = params.intermediary_xpub.owner_address()?;
    let initiator_app = xkey_kth_address(&params.initiating_xpub, installed_app_seq_no(ctx)?)?;
    let (agreement, agreement_sig) = counter_signature(ctx, AGREEMENT_SLOT, &intermediary, ctx.message.signature)?;
    let (app, app_sig) = counter_signature(ctx, APP_SLOT, &initiator_app, ctx.message.signature2)?;
    let (_, intermediary_sig) =
        intermediary_counter_signature(ctx, APP_SLOT, &intermediary, ctx.message.signature3)?;
    Ok(StepOutput::new()
        .with_counter_signature(agreement, agreement_sig)
        .with_counter_signature(app, app_sig)
        .with_counter_signature(app, intermediary_sig))
}

fn reply_to_intermediary(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_install_virtual_app()?;
    let signatures = [
        Some(ctx.my_signature(AGREEMENT_SLOT)?),
        Some(ctx.my_signature(APP_SLOT)?),
        None,
    ];
    Ok(forward(ctx, &params.intermediary_xpub, 3, signatures))
}
