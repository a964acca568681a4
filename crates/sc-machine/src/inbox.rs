//! Keyed inboxes for continuation messages.
//!
//! A run suspended at a wait reads the next message from the queue of its
//! key: the multisig address for channel protocols, the app identity hash
//! for app updates. Messages delivered before anyone waits are buffered;
//! whatever is left when the run holding the key ends is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use sc_crypto::{Address, H256};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{MachineError, MachineResult};
use crate::protocol::ProtocolMessage;

/// Which queue a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InboxKey {
    Multisig(Address),
    App(H256),
}

impl fmt::Display for InboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboxKey::Multisig(address) => write!(f, "{address}"),
            InboxKey::App(app_id) => write!(f, "{app_id}"),
        }
    }
}

struct Queue {
    sender: mpsc::UnboundedSender<ProtocolMessage>,
    /// Taken by the current waiter, put back when it is done.
    receiver: Option<mpsc::UnboundedReceiver<ProtocolMessage>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// Per-key message queues of one node.
#[derive(Default)]
pub struct Inbox {
    queues: Mutex<HashMap<InboxKey, Queue>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` under the key its parameters name.
    pub fn deliver(&self, message: ProtocolMessage) -> MachineResult<()> {
        let key = message.params.inbox_key()?;
        trace!(key = %key, protocol = %message.protocol, seq = message.seq, "deliver");
        let mut queues = self.lock()?;
        queues
            .entry(key)
            .or_insert_with(Queue::new)
            .sender
            .send(message)
            .map_err(|_| MachineError::Transport(format!("Inbox {key} closed")))
    }

    /// Wait for the next message under `key`.
    ///
    /// # Errors
    /// [`MachineError::Transport`] if another task is already waiting on
    /// the same key.
    pub async fn receive(&self, key: &InboxKey) -> MachineResult<ProtocolMessage> {
        let receiver = {
            let mut queues = self.lock()?;
            queues
                .entry(*key)
                .or_insert_with(Queue::new)
                .receiver
                .take()
                .ok_or_else(|| MachineError::Transport(format!("Already waiting on {key}")))?
        };
        let mut waiter = Waiter {
            inbox: self,
            key: *key,
            receiver: Some(receiver),
        };
        waiter.recv().await
    }

    /// Number of buffered messages under `key`.
    pub fn pending(&self, key: &InboxKey) -> usize {
        self.queues
            .lock()
            .ok()
            .and_then(|queues| {
                queues
                    .get(key)
                    .and_then(|queue| queue.receiver.as_ref().map(|receiver| receiver.len()))
            })
            .unwrap_or(0)
    }

    /// Drop every message buffered under `key`.
    ///
    /// # Returns
    /// Number of messages dropped
    pub fn drain(&self, key: &InboxKey) -> usize {
        let Ok(mut queues) = self.queues.lock() else {
            return 0;
        };
        let Some(receiver) = queues.get_mut(key).and_then(|queue| queue.receiver.as_mut()) else {
            return 0;
        };
        let mut dropped = 0;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(key = %key, dropped, "dropped stale messages");
        }
        dropped
    }

    fn lock(&self) -> MachineResult<std::sync::MutexGuard<'_, HashMap<InboxKey, Queue>>> {
        self.queues
            .lock()
            .map_err(|_| MachineError::Transport("Inbox lock poisoned".into()))
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.queues.lock().map(|queues| queues.len()).unwrap_or(0);
        f.debug_struct("Inbox").field("keys", &keys).finish()
    }
}

/// Holds a queue's receiver while waiting and returns it on drop, so a
/// cancelled wait does not lose the queue.
struct Waiter<'a> {
    inbox: &'a Inbox,
    key: InboxKey,
    receiver: Option<mpsc::UnboundedReceiver<ProtocolMessage>>,
}

impl Waiter<'_> {
    async fn recv(&mut self) -> MachineResult<ProtocolMessage> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| MachineError::Transport(format!("Inbox {} closed", self.key)))?;
        receiver
            .recv()
            .await
            .ok_or_else(|| MachineError::Transport(format!("Inbox {} closed", self.key)))
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let (Some(receiver), Ok(mut queues)) = (self.receiver.take(), self.inbox.queues.lock()) {
            if let Some(queue) = queues.get_mut(&self.key) {
                queue.receiver = Some(receiver);
            }
        }
    }
}
