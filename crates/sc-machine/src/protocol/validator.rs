//! Counter-signature validation and outgoing message packaging.
//!
//! Validation is pure: it recovers the signer over a commitment's digest and
//! compares it with the address the protocol expects.

use sc_crypto::{xkey_kth_address, Address, ExtendedPublicKey, Signature};

use crate::error::{MachineError, MachineResult};
use crate::ethereum::EthereumCommitment;
use crate::executor::{Context, StepOutput};
use crate::models::StateChannel;
use crate::protocol::ProtocolMessage;

/// Check that `signature` over `commitment` was made by `expected`.
///
/// # Errors
/// - [`MachineError::MissingCommitment`] / [`MachineError::MissingSignature`]
///   when either is absent
/// - [`MachineError::InvalidSignature`] when another key signed
pub fn validate_signature(
    expected: &Address,
    commitment: Option<&dyn EthereumCommitment>,
    signature: Option<&Signature>,
) -> MachineResult<()> {
    let commitment = commitment.ok_or_else(|| {
        MachineError::MissingCommitment(format!("cannot validate signature of {expected}"))
    })?;
    let signature = signature
        .ok_or_else(|| MachineError::MissingSignature(format!("expected a signature by {expected}")))?;
    let recovered = signature.recover(&commitment.hash_to_sign())?;
    if recovered != *expected {
        return Err(MachineError::InvalidSignature {
            expected: *expected,
            recovered,
        });
    }
    Ok(())
}

/// Like [`validate_signature`], over the intermediary digest.
pub fn validate_intermediary_signature(
    expected: &Address,
    commitment: Option<&dyn EthereumCommitment>,
    signature: Option<&Signature>,
) -> MachineResult<()> {
    let digest = commitment
        .and_then(|commitment| commitment.hash_to_sign_as_intermediary())
        .ok_or_else(|| MachineError::MissingCommitment("no intermediary digest to validate".into()))?;
    let signature = signature
        .ok_or_else(|| MachineError::MissingSignature(format!("expected a signature by {expected}")))?;
    let recovered = signature.recover(&digest)?;
    if recovered != *expected {
        return Err(MachineError::InvalidSignature {
            expected: *expected,
            recovered,
        });
    }
    Ok(())
}

/// Validate a counter-signature on slot `index` made by `expected`.
///
/// # Returns
/// The `(slot, signature)` pair to fold into the context
pub fn counter_signature(
    ctx: &Context,
    index: usize,
    expected: &Address,
    signature: Option<Signature>,
) -> MachineResult<(usize, Signature)> {
    let slot = ctx.slot(index)?;
    validate_signature(expected, Some(slot.commitment.as_ref()), signature.as_ref())?;
    let signature = signature
        .ok_or_else(|| MachineError::MissingSignature(format!("slot {index}")))?;
    if slot.my_signature == Some(signature) {
        return Err(MachineError::DuplicateSignature);
    }
    Ok((index, signature))
}

/// Validate the intermediary's signature on slot `index`.
pub fn intermediary_counter_signature(
    ctx: &Context,
    index: usize,
    expected: &Address,
    signature: Option<Signature>,
) -> MachineResult<(usize, Signature)> {
    let slot = ctx.slot(index)?;
    validate_intermediary_signature(expected, Some(slot.commitment.as_ref()), signature.as_ref())?;
    let signature = signature
        .ok_or_else(|| MachineError::MissingSignature(format!("intermediary on slot {index}")))?;
    Ok((index, signature))
}

/// Counterparty's signing address for slot `index` of a two-party run.
fn counterparty_signer(ctx: &Context, index: usize) -> MachineResult<Address> {
    Ok(xkey_kth_address(ctx.counterparty_xpub(), ctx.slot(index)?.key_index())?)
}

/// A message to `to` numbered `seq` carrying up to three signatures.
pub fn forward(
    ctx: &Context,
    to: &ExtendedPublicKey,
    seq: u32,
    signatures: [Option<Signature>; 3],
) -> StepOutput {
    let [signature, signature2, signature3] = signatures;
    let message = ctx
        .message
        .forward(ctx.my_xpub, *to, seq)
        .with_signatures(signature, signature2, signature3);
    StepOutput::new().with_message(message)
}

/// The initiator's first message: the local signature on slot `index`.
pub fn add_signed_commitment_to_outbox_for_seq1(ctx: &Context, index: usize) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(index)?;
    Ok(forward(ctx, ctx.counterparty_xpub(), 1, [Some(signature), None, None]))
}

/// The responder's reply: the local signature on slot `index`.
pub fn add_signed_commitment_in_response_with_seq2(
    ctx: &Context,
    index: usize,
) -> MachineResult<StepOutput> {
    let signature = ctx.my_signature(index)?;
    let to = ctx.message.from_xpub;
    Ok(forward(ctx, &to, 2, [Some(signature), None, None]))
}

// ============================================================================
// Two-party steps
// ============================================================================

/// Initiator: send the signed commitment.
pub fn send_signature_seq1(ctx: &Context) -> MachineResult<StepOutput> {
    add_signed_commitment_to_outbox_for_seq1(ctx, 0)
}

/// Responder: answer with the signed commitment.
pub fn respond_signature_seq2(ctx: &Context) -> MachineResult<StepOutput> {
    add_signed_commitment_in_response_with_seq2(ctx, 0)
}

/// Responder: check the initiator's signature before signing.
pub fn verify_initiator_signature(ctx: &Context) -> MachineResult<StepOutput> {
    let expected = counterparty_signer(ctx, 0)?;
    let (index, signature) = counter_signature(ctx, 0, &expected, ctx.message.signature)?;
    Ok(StepOutput::new().with_counter_signature(index, signature))
}

/// Initiator: check the responder's reply.
pub fn verify_responder_signature(ctx: &Context) -> MachineResult<StepOutput> {
    let reply = ctx.received()?;
    let expected = counterparty_signer(ctx, 0)?;
    let (index, signature) = counter_signature(ctx, 0, &expected, reply.signature)?;
    Ok(StepOutput::new().with_counter_signature(index, signature))
}

/// Whether `message` came from `xpub`.
pub(crate) fn expect_sender(ctx: &Context, message: &ProtocolMessage, xpub: &ExtendedPublicKey) -> MachineResult<()> {
    if message.from_xpub != *xpub {
        return Err(MachineError::violation(
            ctx.protocol(),
            format!("seq {} from an unexpected sender", message.seq),
        ));
    }
    Ok(())
}

/// The channel a two-party run operates on, owned by exactly its two parties.
pub(crate) fn run_channel<'a>(ctx: &'a Context, multisig_address: &Address) -> MachineResult<&'a StateChannel> {
    let channel = ctx.channel(multisig_address)?;
    let params = ctx.params();
    if !channel.is_between(params.initiating_xpub(), params.responding_xpub()) {
        return Err(MachineError::violation(
            ctx.protocol(),
            format!("channel {multisig_address} is not between the run's parties"),
        ));
    }
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethereum::WithdrawEthCommitment;
    use sc_crypto::{ExtendedPrivateKey, H256, Secp256k1Keypair};

    fn commitment(owners: &[Address]) -> WithdrawEthCommitment {
        WithdrawEthCommitment::new(Address([9; 20]), owners, Address([8; 20]), 3).unwrap()
    }

    #[test]
    fn test_valid_signature() {
        let key = Secp256k1Keypair::generate();
        let c = commitment(&[key.address()]);
        let sig = key.sign_digest(&c.hash_to_sign());
        validate_signature(&key.address(), Some(&c), Some(&sig)).unwrap();
    }

    #[test]
    fn test_wrong_signer() {
        let key = Secp256k1Keypair::generate();
        let other = Secp256k1Keypair::generate();
        let c = commitment(&[key.address()]);
        let sig = other.sign_digest(&c.hash_to_sign());
        let err = validate_signature(&key.address(), Some(&c), Some(&sig)).unwrap_err();
        assert!(matches!(err, MachineError::InvalidSignature { recovered, .. } if recovered == other.address()));
    }

    #[test]
    fn test_signature_on_other_commitment() {
        let key = Secp256k1Keypair::generate();
        let c = commitment(&[key.address()]);
        let sig = key.sign_digest(&H256([4; 32]));
        assert!(validate_signature(&key.address(), Some(&c), Some(&sig)).is_err());
    }

    #[test]
    fn test_missing_inputs() {
        let key = Secp256k1Keypair::generate();
        let c = commitment(&[key.address()]);
        let sig = key.sign_digest(&c.hash_to_sign());
        assert!(matches!(
            validate_signature(&key.address(), None, Some(&sig)),
            Err(MachineError::MissingCommitment(_))
        ));
        assert!(matches!(
            validate_signature(&key.address(), Some(&c), None),
            Err(MachineError::MissingSignature(_))
        ));
    }

    #[test]
    fn test_no_intermediary_digest() {
        let key = ExtendedPrivateKey::generate().kth_keypair(0).unwrap();
        let c = commitment(&[key.address()]);
        let sig = key.sign_digest(&c.hash_to_sign());
        assert!(matches!(
            validate_intermediary_signature(&key.address(), Some(&c), Some(&sig)),
            Err(MachineError::MissingCommitment(_))
        ));
    }
}
