//! Key-value persistence for channels, commitments and the write-ahead log.
//!
//! The engine only needs two operations from its backing store: point reads
//! and atomic batch writes. Values are `serde_json` documents.
//!
//! | Key | Value |
//! |-----|-------|
//! | `channel/<multisig>` | [`StateChannel`] |
//! | `channels` | list of known multisig addresses |
//! | `allCommitments/<hash>` | [`StoredCommitment`] |
//! | `WriteAheadLog.<uid>` | map of unfinished runs |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sc_crypto::{Address, H256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{MachineError, MachineResult};
use crate::ethereum::{CommitmentKind, Transaction};
use crate::models::{StateChannel, StateChannelsMap};
use crate::protocol::Protocol;
use crate::services::CommitmentStore;

/// Index of every channel written through [`save_channels`].
pub const CHANNELS_INDEX_KEY: &str = "channels";

/// Store key of the channel at `multisig_address`.
pub fn channel_key(multisig_address: &Address) -> String {
    format!("channel/{multisig_address}")
}

/// Store key of the commitment with digest `hash`.
pub fn commitment_key(hash: &H256) -> String {
    format!("allCommitments/{hash}")
}

/// Abstract persistent store.
///
/// `set` must apply the whole batch or none of it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> MachineResult<Option<Vec<u8>>>;

    async fn set(&self, entries: Vec<(String, Vec<u8>)>) -> MachineResult<()>;
}

/// In-memory store using a HashMap.
///
/// Suitable for tests and single-process embedding. All data is lost when
/// the store is dropped.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, key: &str) -> MachineResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, entries: Vec<(String, Vec<u8>)>) -> MachineResult<()> {
        let mut map = self.entries.write().await;
        let count = entries.len();
        map.extend(entries);
        debug!(entries = count, "store batch written");
        Ok(())
    }
}

// ============================================================================
// Typed helpers
// ============================================================================

/// Read and decode the JSON value at `key`.
pub async fn get_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> MachineResult<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode `value` as a store entry.
pub fn json_entry<T: Serialize>(key: impl Into<String>, value: &T) -> MachineResult<(String, Vec<u8>)> {
    Ok((key.into(), serde_json::to_vec(value)?))
}

/// Load a single channel.
pub async fn load_channel(store: &dyn Store, multisig_address: &Address) -> MachineResult<Option<StateChannel>> {
    get_json(store, &channel_key(multisig_address)).await
}

/// Load every indexed channel.
///
/// # Errors
/// [`MachineError::Store`] if the index names a channel that is missing.
pub async fn load_channels(store: &dyn Store) -> MachineResult<StateChannelsMap> {
    let index: Vec<Address> = get_json(store, CHANNELS_INDEX_KEY).await?.unwrap_or_default();
    let mut channels = StateChannelsMap::new();
    for address in index {
        let channel = load_channel(store, &address)
            .await?
            .ok_or_else(|| MachineError::Store(format!("indexed channel {address} is missing")))?;
        channels.insert(address, channel);
    }
    Ok(channels)
}

/// Entries writing `channels` and the updated index; empty when
/// `channels` is.
pub async fn channel_entries<'a>(
    store: &dyn Store,
    channels: impl IntoIterator<Item = &'a StateChannel>,
) -> MachineResult<Vec<(String, Vec<u8>)>> {
    let mut index: Vec<Address> = get_json(store, CHANNELS_INDEX_KEY).await?.unwrap_or_default();
    let mut batch = Vec::new();
    for channel in channels {
        let address = channel.multisig_address();
        if !index.contains(&address) {
            index.push(address);
        }
        batch.push(json_entry(channel_key(&address), channel)?);
    }
    if !batch.is_empty() {
        index.sort();
        batch.push(json_entry(CHANNELS_INDEX_KEY, &index)?);
    }
    Ok(batch)
}

/// Write `channels` and the updated index as one batch.
pub async fn save_channels<'a>(
    store: &dyn Store,
    channels: impl IntoIterator<Item = &'a StateChannel>,
) -> MachineResult<()> {
    let batch = channel_entries(store, channels).await?;
    if batch.is_empty() {
        return Ok(());
    }
    store.set(batch).await
}

// ============================================================================
// Commitments
// ============================================================================

/// A fully signed commitment as archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCommitment {
    pub protocol: Protocol,
    pub kind: CommitmentKind,
    pub transaction: Transaction,
}

/// [`CommitmentStore`] writing to a [`Store`] under `allCommitments/<hash>`.
#[derive(Clone)]
pub struct StoreCommitments {
    store: Arc<dyn Store>,
}

impl StoreCommitments {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The archived commitment with digest `hash`.
    pub async fn get(&self, hash: &H256) -> MachineResult<Option<StoredCommitment>> {
        get_json(self.store.as_ref(), &commitment_key(hash)).await
    }
}

#[async_trait]
impl CommitmentStore for StoreCommitments {
    async fn store_commitment(
        &self,
        protocol: Protocol,
        kind: CommitmentKind,
        hash: H256,
        transaction: Transaction,
    ) -> MachineResult<()> {
        let entry = json_entry(
            commitment_key(&hash),
            &StoredCommitment {
                protocol,
                kind,
                transaction,
            },
        )?;
        self.store.set(vec![entry]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_crypto::ExtendedPrivateKey;

    fn channel(byte: u8) -> StateChannel {
        let a = ExtendedPrivateKey::generate().neuter();
        let b = ExtendedPrivateKey::generate().neuter();
        StateChannel::new(Address([byte; 20]), &[a, b]).unwrap()
    }

    #[tokio::test]
    async fn test_batch_roundtrip() {
        let store = InMemoryStore::new();
        store
            .set(vec![("a".into(), vec![1]), ("b".into(), vec![2])])
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(vec![1]));
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_channels_indexed() {
        let store = InMemoryStore::new();
        let first = channel(2);
        let second = channel(1);
        save_channels(&store, [&first]).await.unwrap();
        save_channels(&store, [&second, &first]).await.unwrap();

        let loaded = load_channels(&store).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&first.multisig_address()), Some(&first));

        let index: Vec<Address> = get_json(&store, CHANNELS_INDEX_KEY).await.unwrap().unwrap();
        assert_eq!(index, vec![Address([1; 20]), Address([2; 20])]);
    }

    #[tokio::test]
    async fn test_empty_save_writes_nothing() {
        let store = InMemoryStore::new();
        save_channels(&store, std::iter::empty::<&StateChannel>()).await.unwrap();
        assert!(store.is_empty().await);
        assert!(load_channels(&store).await.unwrap().is_empty());
    }
}
