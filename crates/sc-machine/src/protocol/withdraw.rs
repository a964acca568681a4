//! Withdraw: move part of a party's free balance out of the multisig.
//!
//! Three commitments, signed over two round trips:
//!
//! 1. install a balance-refund app debiting the withdrawer, which pays the
//!    amount back if the withdrawal never lands on chain,
//! 2. the withdrawal itself,
//! 3. the uninstall of the refund app, signed last so the refund stays
//!    enforceable until the withdrawal is fully signed.
//!
//! ```text
//! Initiator                                  Responder
//!   sign 1, 2  ── seq 1 (sig 1, 2) ────────▶  validate, sign 1, 2, 3
//!              ◀── seq 2 (sig 1, 2, 3) ─────
//!   validate, sign 3 ── seq 3 (sig 3) ─────▶  validate
//!   commit                                   commit
//! ```

use sc_abi::{encode, Token};
use sc_crypto::{xkey_kth_address, Address};

use crate::config::NetworkContext;
use crate::error::{MachineError, MachineResult};
use crate::ethereum::{InstallCommitment, UninstallCommitment, WithdrawEthCommitment};
use crate::executor::{CommitmentSlot, Context, StepOutput};
use crate::models::{AppInstance, AppInterface, AppProposal, StateChannel, Terms};
use crate::protocol::validator::{counter_signature, forward, run_channel, validate_signature};
use crate::protocol::ProtocolStep::{self, *};

/// State encoding of the balance-refund app.
pub const BALANCE_REFUND_STATE_ENCODING: &str =
    "tuple(address recipient, address multisig, uint256 threshold)";

const INSTALL_SLOT: usize = 0;
const WITHDRAW_SLOT: usize = 1;
const UNINSTALL_SLOT: usize = 2;

pub const INITIATOR: &[ProtocolStep] = &[
    Compute(install_and_withdraw),
    Sign,
    Compute(send_install_and_withdraw),
    SendAndWait { seq: 2 },
    Compute(verify_reply_and_uninstall),
    Sign,
    Compute(send_uninstall),
    Send,
    Commit,
];

pub const RESPONDER: &[ProtocolStep] = &[
    Compute(install_and_withdraw),
    Compute(verify_install_and_withdraw),
    Compute(uninstall_refund),
    Sign,
    Compute(respond_with_all),
    SendAndWait { seq: 3 },
    Compute(verify_uninstall),
    Commit,
];

/// Proposal for a balance-refund app paying `recipient` whatever the
/// multisig holds above `threshold`, capped at `limit`.
pub fn balance_refund_proposal(
    network: &NetworkContext,
    recipient: Address,
    multisig_address: Address,
    threshold: u128,
    limit: u128,
    default_timeout: u64,
) -> MachineResult<AppProposal> {
    Ok(AppProposal {
        app_interface: AppInterface {
            addr: network.eth_balance_refund,
            state_encoding: BALANCE_REFUND_STATE_ENCODING.to_string(),
            action_encoding: None,
        },
        terms: Terms::eth(limit),
        default_timeout,
        initial_state: encode(&[Token::Tuple(vec![
            Token::Address(recipient),
            Token::Address(multisig_address),
            Token::Uint(threshold),
        ])])?,
    })
}

fn install_and_withdraw(ctx: &Context) -> MachineResult<StepOutput> {
    let params = ctx.params().as_withdraw()?;
    let channel = run_channel(ctx, &params.multisig_address)?;
    let withdrawer = params.initiating_xpub.owner_address()?;

    let threshold = channel.total_value()?.saturating_sub(params.amount);
    let proposal = balance_refund_proposal(
        &ctx.network,
        withdrawer,
        params.multisig_address,
        threshold,
        params.amount,
        ctx.config.free_balance_default_timeout,
    )?;
    let app_seq_no = channel.next_app_seq_no();
    let refund = AppInstance::from_proposal(
        &proposal,
        params.multisig_address,
        channel.signing_keys_for(app_seq_no)?,
        app_seq_no,
        channel.root_nonce_value(),
        false,
    );
    let (alice, bob) = channel.split_for_owner(&withdrawer, params.amount)?;
    let next = channel.install_app(refund.clone(), alice, bob)?;

    let owners = next.multisig_owners();
    let install = InstallCommitment::new(
        &ctx.network,
        params.multisig_address,
        owners,
        next.free_balance()?,
        &refund,
    )?;
    let withdraw = WithdrawEthCommitment::new(params.multisig_address, owners, params.recipient, params.amount)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(install, 0))
        .with_commitment(CommitmentSlot::local(withdraw, 0))
        .with_channel(next))
}

/// The refund app installed by [`install_and_withdraw`]: the channel's most
/// recent install.
fn refund_app(channel: &StateChannel) -> MachineResult<&AppInstance> {
    let seq = channel.num_installed_apps();
    channel
        .app_instances()
        .values()
        .find(|app| app.app_seq_no == seq)
        .ok_or_else(|| MachineError::MissingCommitment(format!("no refund app at seq {seq}")))
}

fn build_uninstall(ctx: &Context) -> MachineResult<(UninstallCommitment, StateChannel)> {
    let params = ctx.params().as_withdraw()?;
    let channel = ctx.channel(&params.multisig_address)?;
    let refund = refund_app(channel)?;
    let next = channel.uninstall_app(&refund.identity_hash()?, 0, 0)?;
    let commitment = UninstallCommitment::new(
        &ctx.network,
        params.multisig_address,
        next.multisig_owners(),
        next.free_balance()?,
        refund.app_seq_no,
    )?;
    Ok((commitment, next))
}

// ============================================================================
// Initiator
// ============================================================================

fn send_install_and_withdraw(ctx: &Context) -> MachineResult<StepOutput> {
    let signatures = [
        Some(ctx.my_signature(INSTALL_SLOT)?),
        Some(ctx.my_signature(WITHDRAW_SLOT)?),
        None,
    ];
    Ok(forward(ctx, ctx.counterparty_xpub(), 1, signatures))
}

fn verify_reply_and_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let reply = ctx.received()?;
    let responder = xkey_kth_address(ctx.counterparty_xpub(), 0)?;
    let (install, install_sig) = counter_signature(ctx, INSTALL_SLOT, &responder, reply.signature)?;
    let (withdraw, withdraw_sig) = counter_signature(ctx, WITHDRAW_SLOT, &responder, reply.signature2)?;

    let (uninstall, next) = build_uninstall(ctx)?;
    validate_signature(&responder, Some(&uninstall), reply.signature3.as_ref())?;
    let uninstall_sig = reply
        .signature3
        .ok_or_else(|| MachineError::MissingSignature("refund uninstall".into()))?;

    Ok(StepOutput::new()
        .with_counter_signature(install, install_sig)
        .with_counter_signature(withdraw, withdraw_sig)
        .with_commitment(CommitmentSlot::local(uninstall, 0).with_counter_signature(uninstall_sig))
        .with_channel(next))
}

fn send_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(UNINSTALL_SLOT)?;
    Ok(forward(ctx, ctx.counterparty_xpub(), 3, [Some(signature), None, None]))
}

// ============================================================================
// Responder
// ============================================================================

fn verify_install_and_withdraw(ctx: &Context) -> MachineResult<StepOutput> {
    let initiator = xkey_kth_address(ctx.counterparty_xpub(), 0)?;
    let (install, install_sig) = counter_signature(ctx, INSTALL_SLOT, &initiator, ctx.message.signature)?;
    let (withdraw, withdraw_sig) =
        counter_signature(ctx, WITHDRAW_SLOT, &initiator, ctx.message.signature2)?;
    Ok(StepOutput::new()
        .with_counter_signature(install, install_sig)
        .with_counter_signature(withdraw, withdraw_sig))
}

fn uninstall_refund(ctx: &Context) -> MachineResult<StepOutput> {
    let (uninstall, next) = build_uninstall(ctx)?;
    Ok(StepOutput::new()
        .with_commitment(CommitmentSlot::local(uninstall, 0))
        .with_channel(next))
}

fn respond_with_all(ctx: &Context) -> MachineResult<StepOutput> {
    let signatures = [
        Some(ctx.my_signature(INSTALL_SLOT)?),
        Some(ctx.my_signature(WITHDRAW_SLOT)?),
        Some(ctx.my_signature(UNINSTALL_SLOT)?),
    ];
    let to = ctx.message.from_xpub;
    Ok(forward(ctx, &to, 2, signatures))
}

fn verify_uninstall(ctx: &Context) -> MachineResult<StepOutput> {
    let message = ctx.received()?;
    let initiator = xkey_kth_address(ctx.counterparty_xpub(), 0)?;
    let (index, signature) = counter_signature(ctx, UNINSTALL_SLOT, &initiator, message.signature)?;
    Ok(StepOutput::new().with_counter_signature(index, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_abi::AbiReader;

    #[test]
    fn test_refund_state_layout() {
        let network = NetworkContext::deterministic();
        let proposal =
            balance_refund_proposal(&network, Address([1; 20]), Address([2; 20]), 30, 10, 100).unwrap();
        assert_eq!(proposal.terms.limit, 10);
        assert_eq!(proposal.app_interface.addr, network.eth_balance_refund);

        let mut reader = AbiReader::new(&proposal.initial_state);
        assert_eq!(reader.read_address().unwrap(), Address([1; 20]));
        assert_eq!(reader.read_address().unwrap(), Address([2; 20]));
        assert_eq!(reader.read_uint().unwrap(), 30);
    }
}
