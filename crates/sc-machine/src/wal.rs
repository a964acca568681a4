//! Write-ahead log of in-flight protocol runs.
//!
//! Every run with a log attached records its starting point and each effect
//! as it happens: local signatures, completed sends, received messages. The
//! whole log of a node lives under one store key, `WriteAheadLog.<uid>`, as a
//! JSON map from run key to [`WalRecord`]. A failed run's record is removed
//! when it aborts; a successful run's record is removed in the same store
//! batch that persists its channels ([`WriteAheadLog::clear_with`]). Whatever
//! is left after a restart is unfinished work.

use std::collections::BTreeMap;
use std::sync::Arc;

use sc_crypto::Signature;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::MachineResult;
use crate::models::StateChannelsMap;
use crate::opcode::Opcode;
use crate::protocol::{ProtocolMessage, Role};
use crate::store::{get_json, json_entry, Store};

/// Everything needed to replay one run up to where it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalRecord {
    pub role: Role,
    /// The message the run started from.
    pub message: ProtocolMessage,
    /// Channels as they were when the run started.
    pub state_channels: StateChannelsMap,
    /// Index of the next step to run.
    pub instruction_pointer: usize,
    pub last_opcode: Option<Opcode>,
    /// Local signatures in the order they were made.
    pub signatures: Vec<Signature>,
    pub sends_completed: usize,
    /// Messages returned by waits, in order.
    pub received: Vec<ProtocolMessage>,
}

impl WalRecord {
    pub fn new(role: Role, message: ProtocolMessage, state_channels: StateChannelsMap) -> Self {
        Self {
            role,
            message,
            state_channels,
            instruction_pointer: 0,
            last_opcode: None,
            signatures: Vec::new(),
            sends_completed: 0,
            received: Vec::new(),
        }
    }

    /// `<protocol>/<to>/<from>/<multisig>/<appId>`, with `none` when the
    /// run names no app.
    pub fn key(&self) -> MachineResult<String> {
        let message = &self.message;
        let app = message
            .params
            .app_identity_hash()
            .map(|hash| hash.to_string())
            .unwrap_or_else(|| "none".to_string());
        Ok(format!(
            "{}/{}/{}/{}/{}",
            message.protocol,
            message.to_xpub,
            message.from_xpub,
            message.params.multisig_address()?,
            app
        ))
    }
}

/// Store-backed log of one node's unfinished runs.
pub struct WriteAheadLog {
    store: Arc<dyn Store>,
    uid: String,
    /// Serializes read-modify-write of the log entry.
    guard: Mutex<()>,
}

impl WriteAheadLog {
    pub fn new(store: Arc<dyn Store>, uid: impl Into<String>) -> Self {
        Self {
            store,
            uid: uid.into(),
            guard: Mutex::new(()),
        }
    }

    fn store_key(&self) -> String {
        format!("WriteAheadLog.{}", self.uid)
    }

    async fn load(&self) -> MachineResult<BTreeMap<String, WalRecord>> {
        Ok(get_json(self.store.as_ref(), &self.store_key())
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, log: &BTreeMap<String, WalRecord>) -> MachineResult<()> {
        self.store.set(vec![json_entry(self.store_key(), log)?]).await
    }

    /// Every recorded run, by key.
    pub async fn read_log(&self) -> MachineResult<BTreeMap<String, WalRecord>> {
        let _guard = self.guard.lock().await;
        self.load().await
    }

    /// Record or overwrite `record`.
    pub async fn write(&self, record: &WalRecord) -> MachineResult<()> {
        let key = record.key()?;
        let _guard = self.guard.lock().await;
        let mut log = self.load().await?;
        log.insert(key.clone(), record.clone());
        self.save(&log).await?;
        trace!(
            key = %key,
            pointer = record.instruction_pointer,
            signatures = record.signatures.len(),
            "write-ahead log updated"
        );
        Ok(())
    }

    /// Drop `record`. Clearing a run that was never logged is not an error.
    pub async fn clear(&self, record: &WalRecord) -> MachineResult<()> {
        let key = record.key()?;
        let _guard = self.guard.lock().await;
        let mut log = self.load().await?;
        if log.remove(&key).is_some() {
            self.save(&log).await?;
            debug!(key = %key, "write-ahead log entry cleared");
        }
        Ok(())
    }

    /// Drop the record under `key` and write `entries` in the same batch.
    ///
    /// `entries` go to this log's store, which must be the one they belong
    /// in for the write to be atomic.
    pub async fn clear_with(&self, key: &str, mut entries: Vec<(String, Vec<u8>)>) -> MachineResult<()> {
        let _guard = self.guard.lock().await;
        let mut log = self.load().await?;
        let cleared = log.remove(key).is_some();
        if cleared {
            entries.push(json_entry(self.store_key(), &log)?);
        }
        if !entries.is_empty() {
            self.store.set(entries).await?;
        }
        debug!(key = %key, cleared, "write-ahead log committed");
        Ok(())
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog").field("uid", &self.uid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolParams, SetupParams};
    use crate::store::InMemoryStore;
    use sc_crypto::{Address, ExtendedPrivateKey};

    fn record(multisig: u8) -> WalRecord {
        let a = ExtendedPrivateKey::generate().neuter();
        let b = ExtendedPrivateKey::generate().neuter();
        let params = ProtocolParams::Setup(SetupParams {
            initiating_xpub: a,
            responding_xpub: b,
            multisig_address: Address([multisig; 20]),
        });
        WalRecord::new(Role::Initiator, ProtocolMessage::starting(params, a, b), StateChannelsMap::new())
    }

    #[test]
    fn test_key_layout() {
        let record = record(7);
        let key = record.key().unwrap();
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "Setup");
        assert_eq!(parts[3], Address([7; 20]).to_string());
        assert_eq!(parts[4], "none");
    }

    #[tokio::test]
    async fn test_write_then_clear() {
        let store = Arc::new(InMemoryStore::new());
        let wal = WriteAheadLog::new(store.clone(), "node");
        let first = record(1);
        let mut second = record(2);
        wal.write(&first).await.unwrap();
        wal.write(&second).await.unwrap();

        second.instruction_pointer = 3;
        second.last_opcode = Some(Opcode::IoSend);
        wal.write(&second).await.unwrap();

        let log = wal.read_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&second.key().unwrap()), Some(&second));

        wal.clear(&first).await.unwrap();
        wal.clear(&first).await.unwrap();
        let log = wal.read_log().await.unwrap();
        assert_eq!(log.keys().collect::<Vec<_>>(), vec![&second.key().unwrap()]);
    }

    #[tokio::test]
    async fn test_survives_new_instance() {
        let store = Arc::new(InMemoryStore::new());
        let record = record(3);
        WriteAheadLog::new(store.clone(), "node").write(&record).await.unwrap();

        let reopened = WriteAheadLog::new(store.clone(), "node");
        assert_eq!(reopened.read_log().await.unwrap().len(), 1);
        let other = WriteAheadLog::new(store, "other");
        assert!(other.read_log().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_with_writes_one_batch() {
        let store = Arc::new(InMemoryStore::new());
        let wal = WriteAheadLog::new(store.clone(), "node");
        let record = record(4);
        let key = record.key().unwrap();
        wal.write(&record).await.unwrap();

        let entry = json_entry("channel/x", &7u32).unwrap();
        wal.clear_with(&key, vec![entry]).await.unwrap();
        assert!(wal.read_log().await.unwrap().is_empty());
        assert_eq!(get_json::<u32>(store.as_ref(), "channel/x").await.unwrap(), Some(7));

        // a key already gone still writes the entries
        let entry = json_entry("channel/x", &8u32).unwrap();
        wal.clear_with(&key, vec![entry]).await.unwrap();
        assert_eq!(get_json::<u32>(store.as_ref(), "channel/x").await.unwrap(), Some(8));
    }
}
