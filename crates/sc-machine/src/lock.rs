//! Per-key locks serializing protocol runs.
//!
//! A run locks every resource key it touches (the inbox key plus the
//! channels it changes) before starting and unlocks them when it ends, so
//! at most one run per key is in flight. Lock state lives behind a
//! [`LockService`]; the [`LockManager`] checks and sets all keys of a call
//! under one local mutex and acquires them in sorted order.
//!
//! # Nesting
//!
//! Some operations run others inside their own locks: a deposit installs
//! and then uninstalls a balance-refund app on the channel it already holds.
//! Each holder gets a [`LockToken`]. A child started through
//! [`LockManager::execute_nested`] with its parent's token treats the
//! parent's keys as its own; it neither locks nor unlocks them. The same
//! operation started without that token contends like any other.
//!
//! | Parent | Children |
//! |--------|----------|
//! | `Deposit` | `Install`, `Uninstall` |
//!
//! # Contention
//!
//! A key held by any other operation fails the attempt with
//! [`MachineError::LockContention`]. The manager backs off exponentially and
//! retries up to [`MachineConfig::lock_retry_attempts`] times before giving
//! the error to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use sc_crypto::{random_bytes_32, H256};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::config::MachineConfig;
use crate::error::{MachineError, MachineResult};

/// Operations that may run inside locks held by another operation.
const NESTED_OPERATIONS: &[(&str, &[&str])] = &[("Deposit", &["Install", "Uninstall"])];

/// Whether `child` may run inside locks held by `parent`.
pub fn is_nested_allowed(parent: &str, child: &str) -> bool {
    NESTED_OPERATIONS
        .iter()
        .any(|(p, children)| *p == parent && children.contains(&child))
}

/// State of one lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Operation that last held the key.
    pub operation: String,
    pub locked: bool,
    /// Token of the current holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<H256>,
}

/// Handed to the closure run under locks; pass it on to run a child
/// operation inside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    holder: H256,
    operation: String,
}

impl LockToken {
    fn new(operation: &str) -> Self {
        Self {
            holder: H256(random_bytes_32()),
            operation: operation.to_string(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

/// Backend holding lock state.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn get(&self, key: &str) -> MachineResult<Option<LockState>>;

    async fn set(&self, key: &str, state: LockState) -> MachineResult<()>;
}

/// In-memory lock backend.
#[derive(Default, Clone)]
pub struct InMemoryLockService {
    locks: Arc<RwLock<HashMap<String, LockState>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn get(&self, key: &str) -> MachineResult<Option<LockState>> {
        Ok(self.locks.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, state: LockState) -> MachineResult<()> {
        self.locks.write().await.insert(key.to_string(), state);
        Ok(())
    }
}

/// Serializes operations per key.
pub struct LockManager {
    service: Arc<dyn LockService>,
    config: MachineConfig,
    guard: Arc<Mutex<()>>,
}

impl LockManager {
    pub fn new(service: Arc<dyn LockService>, config: MachineConfig) -> Self {
        Self {
            service,
            config,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Whether `key` is currently locked.
    pub async fn is_locked(&self, key: &str) -> MachineResult<bool> {
        Ok(self
            .service
            .get(key)
            .await?
            .is_some_and(|state| state.locked))
    }

    /// Run `f` while holding every key in `keys` for `operation`.
    ///
    /// Keys are released whether `f` succeeds, fails or is dropped.
    ///
    /// # Errors
    /// [`MachineError::LockContention`] once retries are exhausted, or
    /// whatever `f` returns.
    pub async fn execute_within_locks<F, Fut, T>(
        &self,
        operation: &str,
        keys: &[String],
        f: F,
    ) -> MachineResult<T>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = MachineResult<T>>,
    {
        self.run_locked(None, operation, keys, f).await
    }

    /// Run `f` for `operation` inside locks held by `parent`.
    ///
    /// Keys `parent` holds are shared when `operation` may nest in it; any
    /// other key is locked and released as in [`Self::execute_within_locks`].
    pub async fn execute_nested<F, Fut, T>(
        &self,
        parent: &LockToken,
        operation: &str,
        keys: &[String],
        f: F,
    ) -> MachineResult<T>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = MachineResult<T>>,
    {
        self.run_locked(Some(parent), operation, keys, f).await
    }

    async fn run_locked<F, Fut, T>(
        &self,
        parent: Option<&LockToken>,
        operation: &str,
        keys: &[String],
        f: F,
    ) -> MachineResult<T>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = MachineResult<T>>,
    {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let token = LockToken::new(operation);
        let acquired = self.acquire_with_retry(&token, parent, &keys).await?;
        let mut release = Release {
            service: self.service.clone(),
            guard: self.guard.clone(),
            operation: operation.to_string(),
            keys: acquired,
        };

        let result = f(token).await;
        release.release_now().await?;
        result
    }

    async fn acquire_with_retry(
        &self,
        token: &LockToken,
        parent: Option<&LockToken>,
        keys: &[String],
    ) -> MachineResult<Vec<String>> {
        let operation = token.operation();
        let mut attempt = 0;
        loop {
            match self.try_acquire(token, parent, keys).await {
                Ok(acquired) => return Ok(acquired),
                Err(err) if err.is_retryable() && attempt < self.config.lock_retry_attempts => {
                    attempt += 1;
                    let backoff = self.config.lock_backoff(attempt);
                    warn!(
                        operation,
                        error = %err,
                        attempt,
                        max = self.config.lock_retry_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "lock busy, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Check every key, then lock those not already held by `parent`.
    ///
    /// # Returns
    /// The keys this call locked and must unlock.
    async fn try_acquire(
        &self,
        token: &LockToken,
        parent: Option<&LockToken>,
        keys: &[String],
    ) -> MachineResult<Vec<String>> {
        let operation = token.operation();
        let _guard = self.guard.lock().await;
        let mut to_lock = Vec::with_capacity(keys.len());
        for key in keys {
            match self.service.get(key).await? {
                Some(state) if state.locked => {
                    let shared = parent.is_some_and(|parent| {
                        state.holder == Some(parent.holder)
                            && is_nested_allowed(&parent.operation, operation)
                    });
                    if shared {
                        trace!(key = %key, parent = %state.operation, operation, "running nested");
                        continue;
                    }
                    return Err(MachineError::LockContention {
                        key: key.clone(),
                        held_by: state.operation,
                    });
                }
                _ => to_lock.push(key.clone()),
            }
        }
        for key in &to_lock {
            self.service
                .set(
                    key,
                    LockState {
                        operation: operation.to_string(),
                        locked: true,
                        holder: Some(token.holder),
                    },
                )
                .await?;
        }
        debug!(operation, keys = ?to_lock, "locks acquired");
        Ok(to_lock)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("config", &self.config).finish()
    }
}

/// Unlocks its keys when released, or from a spawned task if dropped first.
struct Release {
    service: Arc<dyn LockService>,
    guard: Arc<Mutex<()>>,
    operation: String,
    keys: Vec<String>,
}

impl Release {
    async fn release_now(&mut self) -> MachineResult<()> {
        let keys = std::mem::take(&mut self.keys);
        unlock(self.service.as_ref(), &self.guard, &self.operation, &keys).await
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        let service = self.service.clone();
        let guard = self.guard.clone();
        let operation = std::mem::take(&mut self.operation);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = unlock(service.as_ref(), &guard, &operation, &keys).await {
                        warn!(operation = %operation, error = %err, "failed to release dropped locks");
                    }
                });
            }
            Err(_) => warn!(operation = %operation, keys = ?keys, "locks dropped outside a runtime"),
        }
    }
}

async fn unlock(
    service: &dyn LockService,
    guard: &Mutex<()>,
    operation: &str,
    keys: &[String],
) -> MachineResult<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let _guard = guard.lock().await;
    for key in keys {
        service
            .set(
                key,
                LockState {
                    operation: operation.to_string(),
                    locked: false,
                    holder: None,
                },
            )
            .await?;
    }
    debug!(operation, keys = ?keys, "locks released");
    Ok(())
}
