//! Error types for the protocol engine.
//!
//! Validation errors abort a protocol run before any durable state is
//! touched. Only [`MachineError::LockContention`] is retried; everything else
//! surfaces to the caller.

use sc_crypto::{Address, H256, ParseHexError, SignatureError, XKeyError};
use thiserror::Error;

use crate::protocol::Protocol;

/// Errors that can occur while running protocols or transitioning channels.
#[derive(Debug, Error)]
pub enum MachineError {
    /// A counterparty signature did not recover to the expected signer.
    #[error("Invalid signature: expected signer {expected}, recovered {recovered}")]
    InvalidSignature { expected: Address, recovered: Address },

    /// A counterparty signature was byte-identical to our own.
    #[error("Counterparty signature duplicates the local signature")]
    DuplicateSignature,

    /// Validation was asked about a commitment that was never built.
    #[error("Missing commitment: {0}")]
    MissingCommitment(String),

    /// A message that must carry a signature did not.
    #[error("Missing signature: {0}")]
    MissingSignature(String),

    /// A message arrived out of order, for the wrong protocol, or not at all.
    #[error("Protocol violation in {protocol}: {reason}")]
    ProtocolViolation { protocol: Protocol, reason: String },

    /// No app with this identity hash is installed.
    #[error("Unknown app instance {0}")]
    UnknownApp(H256),

    /// No channel with this multisig address is known.
    #[error("Unknown channel {0}")]
    UnknownChannel(Address),

    /// A balance would go negative.
    #[error("Insufficient funds: {owner} has {available}, needs {required}")]
    InsufficientFunds {
        owner: Address,
        available: u128,
        required: u128,
    },

    /// A payout exceeds what the app may distribute.
    #[error("Invalid payout: {payout} exceeds limit {limit}")]
    InvalidPayout { payout: u128, limit: u128 },

    /// An app's funding does not match the limit it may pay out.
    #[error("Collateral mismatch: app funded with {funded}, limit {limit}")]
    CollateralMismatch { funded: u128, limit: u128 },

    /// A stored channel does not have exactly two owners.
    #[error("Channel {multisig} has {owners} owners, expected 2")]
    MalformedChannel { multisig: Address, owners: usize },

    /// A lock is held by an unrelated operation; retried with backoff.
    #[error("Lock on {key} held by {held_by}")]
    LockContention { key: String, held_by: String },

    /// An app was installed with a sequence number the channel did not expect.
    #[error("App sequence conflict: expected {expected}, got {actual}")]
    NestedAppSequenceConflict { expected: u64, actual: u64 },

    /// The channel has no free balance (setup has not run).
    #[error("Channel {0} has no free balance")]
    FreeBalanceMissing(Address),

    /// The channel was already set up.
    #[error("Channel {0} is already set up")]
    AlreadySetUp(Address),

    /// An address is not one of the channel's owners.
    #[error("{0} is not an owner of the channel")]
    NotAnOwner(Address),

    /// Persistent store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message delivery failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Key derivation or signing failure.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// ABI encoding failure while building a commitment.
    #[error("ABI error: {0}")]
    Abi(#[from] sc_abi::AbiError),

    /// Balance arithmetic overflowed.
    #[error("Balance overflow")]
    BalanceOverflow,
}

/// Result type for protocol engine operations.
pub type MachineResult<T> = Result<T, MachineError>;

impl MachineError {
    /// Whether the operation may be retried after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MachineError::LockContention { .. })
    }

    pub(crate) fn violation(protocol: Protocol, reason: impl Into<String>) -> Self {
        MachineError::ProtocolViolation {
            protocol,
            reason: reason.into(),
        }
    }
}

impl From<SignatureError> for MachineError {
    fn from(err: SignatureError) -> Self {
        MachineError::Crypto(err.to_string())
    }
}

impl From<XKeyError> for MachineError {
    fn from(err: XKeyError) -> Self {
        MachineError::Crypto(err.to_string())
    }
}

impl From<ParseHexError> for MachineError {
    fn from(err: ParseHexError) -> Self {
        MachineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MachineError {
    fn from(err: serde_json::Error) -> Self {
        MachineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MachineError::InsufficientFunds {
            owner: Address::ZERO,
            available: 3,
            required: 7,
        };
        let text = err.to_string();
        assert!(text.contains('3'));
        assert!(text.contains('7'));
    }

    #[test]
    fn test_only_lock_contention_is_retryable() {
        let contention = MachineError::LockContention {
            key: "channel".into(),
            held_by: "Install".into(),
        };
        assert!(contention.is_retryable());
        assert!(!MachineError::UnknownApp(H256::ZERO).is_retryable());
        assert!(!MachineError::violation(Protocol::Setup, "seq").is_retryable());
    }

    #[test]
    fn test_signature_error_conversion() {
        let err: MachineError = SignatureError::RecoveryFailed.into();
        assert!(matches!(err, MachineError::Crypto(_)));
    }
}
