//! In-process implementations of the engine's services.
//!
//! Used by the tests and by embedders running several nodes in one process.
//!
//! ```text
//!   node A ── InMemoryTransport ─┐                ┌─▶ node B receiver
//!                                ├─ InMemoryNetwork ┤
//!   node C ── InMemoryTransport ─┘                └─▶ node C receiver
//! ```
//!
//! Every message addressed to a node lands on the receiver returned by
//! [`InMemoryNetwork::connect`]; the node's runner decides whether it starts
//! a run or continues one waiting in the transport's [`Inbox`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sc_crypto::{ExtendedPrivateKey, ExtendedPublicKey, H256, Signature};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use crate::error::{MachineError, MachineResult};
use crate::ethereum::{CommitmentKind, Transaction};
use crate::inbox::{Inbox, InboxKey};
use crate::protocol::{Protocol, ProtocolMessage};
use crate::services::{CommitmentStore, IoTransport, SigningService};
use crate::store::StoredCommitment;

// ============================================================================
// Signing
// ============================================================================

/// Signs with child keys of a locally held extended private key.
pub struct LocalSigner {
    key: ExtendedPrivateKey,
    xpub: ExtendedPublicKey,
}

impl LocalSigner {
    pub fn new(key: ExtendedPrivateKey) -> Self {
        let xpub = key.neuter();
        Self { key, xpub }
    }

    /// A signer with a fresh random key.
    pub fn generate() -> Self {
        Self::new(ExtendedPrivateKey::generate())
    }
}

#[async_trait]
impl SigningService for LocalSigner {
    fn extended_public_key(&self) -> ExtendedPublicKey {
        self.xpub
    }

    async fn sign(&self, digest: &H256, key_index: u64) -> MachineResult<Signature> {
        let keypair = self.key.kth_keypair(key_index)?;
        Ok(keypair.sign_digest(digest))
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner").field("xpub", &self.xpub).finish()
    }
}

// ============================================================================
// Messaging
// ============================================================================

type Routes = Arc<RwLock<HashMap<ExtendedPublicKey, mpsc::UnboundedSender<ProtocolMessage>>>>;

/// Routes messages between nodes of one process by recipient xpub.
#[derive(Default, Clone)]
pub struct InMemoryNetwork {
    routes: Routes,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the node `xpub`.
    ///
    /// # Returns
    /// The node's transport and the receiver of every message addressed to
    /// it. Reconnecting replaces the previous receiver.
    pub async fn connect(
        &self,
        xpub: ExtendedPublicKey,
    ) -> (Arc<InMemoryTransport>, mpsc::UnboundedReceiver<ProtocolMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.routes.write().await.insert(xpub, sender);
        debug!(node = %xpub, "node connected");
        let transport = Arc::new(InMemoryTransport {
            routes: self.routes.clone(),
            inbox: Arc::new(Inbox::new()),
            sent: AtomicUsize::new(0),
        });
        (transport, receiver)
    }

    /// Detach `xpub`; later sends to it fail.
    pub async fn disconnect(&self, xpub: &ExtendedPublicKey) {
        self.routes.write().await.remove(xpub);
    }
}

/// One node's view of an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    routes: Routes,
    inbox: Arc<Inbox>,
    sent: AtomicUsize,
}

impl InMemoryTransport {
    /// Queues that waiting runs read continuation messages from.
    pub fn inbox(&self) -> Arc<Inbox> {
        self.inbox.clone()
    }

    /// Messages sent through this transport so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IoTransport for InMemoryTransport {
    async fn send(&self, to: &ExtendedPublicKey, message: ProtocolMessage) -> MachineResult<()> {
        let routes = self.routes.read().await;
        let route = routes
            .get(to)
            .ok_or_else(|| MachineError::Transport(format!("No route to {to}")))?;
        trace!(to = %to, protocol = %message.protocol, seq = message.seq, "routing message");
        route
            .send(message)
            .map_err(|_| MachineError::Transport(format!("Node {to} stopped receiving")))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self, key: &InboxKey) -> MachineResult<ProtocolMessage> {
        self.inbox.receive(key).await
    }
}

// ============================================================================
// Commitments
// ============================================================================

/// Keeps signed commitments in memory for inspection.
#[derive(Default, Clone)]
pub struct InMemoryCommitmentStore {
    commitments: Arc<RwLock<Vec<(H256, StoredCommitment)>>>,
}

impl InMemoryCommitmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored commitments in the order they were written.
    pub async fn commitments(&self) -> Vec<(H256, StoredCommitment)> {
        self.commitments.read().await.clone()
    }

    /// Stored commitments of `kind`.
    pub async fn of_kind(&self, kind: CommitmentKind) -> Vec<StoredCommitment> {
        self.commitments
            .read()
            .await
            .iter()
            .filter(|(_, stored)| stored.kind == kind)
            .map(|(_, stored)| stored.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.commitments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.commitments.read().await.is_empty()
    }
}

#[async_trait]
impl CommitmentStore for InMemoryCommitmentStore {
    async fn store_commitment(
        &self,
        protocol: Protocol,
        kind: CommitmentKind,
        hash: H256,
        transaction: Transaction,
    ) -> MachineResult<()> {
        self.commitments.write().await.push((
            hash,
            StoredCommitment {
                protocol,
                kind,
                transaction,
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolParams, SetupParams};
    use sc_crypto::Address;

    fn message(from: ExtendedPublicKey, to: ExtendedPublicKey) -> ProtocolMessage {
        let params = ProtocolParams::Setup(SetupParams {
            initiating_xpub: from,
            responding_xpub: to,
            multisig_address: Address([5; 20]),
        });
        ProtocolMessage::starting(params, from, to)
    }

    #[tokio::test]
    async fn test_signer_uses_child_keys() {
        let key = ExtendedPrivateKey::generate();
        let signer = LocalSigner::new(key.clone());
        let digest = H256([3; 32]);
        let signature = signer.sign(&digest, 4).await.unwrap();
        assert_eq!(
            signature.recover(&digest).unwrap(),
            key.neuter().kth_address(4).unwrap()
        );
    }

    #[tokio::test]
    async fn test_routes_by_recipient() {
        let network = InMemoryNetwork::new();
        let a = ExtendedPrivateKey::generate().neuter();
        let b = ExtendedPrivateKey::generate().neuter();
        let (transport_a, mut inbound_a) = network.connect(a).await;
        let (_transport_b, mut inbound_b) = network.connect(b).await;

        transport_a.send(&b, message(a, b)).await.unwrap();
        assert_eq!(inbound_b.recv().await.unwrap().from_xpub, a);
        assert!(inbound_a.try_recv().is_err());
        assert_eq!(transport_a.sent(), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_node_fails() {
        let network = InMemoryNetwork::new();
        let a = ExtendedPrivateKey::generate().neuter();
        let b = ExtendedPrivateKey::generate().neuter();
        let (transport, _inbound) = network.connect(a).await;
        assert!(matches!(
            transport.send(&b, message(a, b)).await,
            Err(MachineError::Transport(_))
        ));
        assert_eq!(transport.sent(), 0);
    }
}
