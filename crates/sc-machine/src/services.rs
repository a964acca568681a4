//! Services the executor performs effects through.
//!
//! The executor never touches keys, sockets or storage directly. Embedders
//! provide these traits; [`crate::memory`] has in-process implementations.

use async_trait::async_trait;
use sc_crypto::{ExtendedPublicKey, H256, Signature};

use crate::error::MachineResult;
use crate::ethereum::{CommitmentKind, Transaction};
use crate::inbox::InboxKey;
use crate::models::AppInstance;
use crate::protocol::{Protocol, ProtocolMessage};

/// Holder of the local node's keys.
#[async_trait]
pub trait SigningService: Send + Sync {
    /// The node's public identity.
    fn extended_public_key(&self) -> ExtendedPublicKey;

    /// Sign `digest` with the child key at `key_index`.
    async fn sign(&self, digest: &H256, key_index: u64) -> MachineResult<Signature>;
}

/// Delivery of protocol messages between nodes.
#[async_trait]
pub trait IoTransport: Send + Sync {
    async fn send(&self, to: &ExtendedPublicKey, message: ProtocolMessage) -> MachineResult<()>;

    /// Next message queued under `key`.
    async fn receive(&self, key: &InboxKey) -> MachineResult<ProtocolMessage>;
}

/// Durable archive of fully signed commitments.
#[async_trait]
pub trait CommitmentStore: Send + Sync {
    async fn store_commitment(
        &self,
        protocol: Protocol,
        kind: CommitmentKind,
        hash: H256,
        transaction: Transaction,
    ) -> MachineResult<()>;
}

/// App-specific state transition used by the TakeAction protocol.
pub trait AppLogic: Send + Sync {
    /// The state `app` moves to when `action` is applied to its latest state.
    ///
    /// Must be deterministic: both parties compute it independently and
    /// sign the result.
    fn apply_action(&self, app: &AppInstance, action: &[u8]) -> MachineResult<Vec<u8>>;
}
