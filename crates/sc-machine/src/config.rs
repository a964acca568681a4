//! Engine configuration.
//!
//! [`NetworkContext`] holds the addresses of the on-chain contracts that
//! commitments call into. [`MachineConfig`] holds the tunables of the engine
//! itself.

use std::time::Duration;

use sc_crypto::Address;
use serde::{Deserialize, Serialize};

/// Default timeout (in blocks) of the free balance app.
pub const FREE_BALANCE_DEFAULT_TIMEOUT: u64 = 172_800;

/// Nonce a virtual app is frozen at when it is locked for uninstall.
pub const NONCE_EXPIRY: u64 = 65_536;

/// Maximum attempts to acquire a contended lock.
pub const LOCK_RETRY_ATTEMPTS: u32 = 5;

/// Initial lock retry backoff (50 ms), doubled on every attempt.
pub const LOCK_RETRY_BACKOFF_MS: u64 = 50;

/// Addresses of the contracts commitments target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContext {
    /// Registry that stores app states and resolves disputes.
    pub app_registry: Address,
    /// Registry of dependency nonces used to invalidate conditional transactions.
    pub nonce_registry: Address,
    /// Batches several calls into one multisig transaction.
    pub multi_send: Address,
    /// Delegate target executing an app's conditional transaction.
    pub state_channel_transaction: Address,
    /// Delegate target executing a virtual-app agreement.
    pub eth_virtual_app_agreement: Address,
    /// App definition of the ETH free balance.
    pub eth_bucket: Address,
    /// App definition of the balance-refund app used by deposits and withdrawals.
    pub eth_balance_refund: Address,
}

impl NetworkContext {
    /// A network with deterministic, distinct placeholder addresses.
    ///
    /// Useful wherever commitments are built but never broadcast.
    pub fn deterministic() -> Self {
        let addr = |tag: u8| Address([tag; 20]);
        Self {
            app_registry: addr(0xa1),
            nonce_registry: addr(0xa2),
            multi_send: addr(0xa3),
            state_channel_transaction: addr(0xa4),
            eth_virtual_app_agreement: addr(0xa5),
            eth_bucket: addr(0xa6),
            eth_balance_refund: addr(0xa7),
        }
    }
}

/// Tunables for the protocol engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Maximum attempts to acquire a contended lock.
    pub lock_retry_attempts: u32,

    /// Initial lock retry backoff in milliseconds.
    pub lock_retry_backoff_ms: u64,

    /// Default timeout of a newly set up free balance.
    pub free_balance_default_timeout: u64,

    /// Nonce virtual apps are locked at.
    pub nonce_expiry: u64,
}

impl MachineConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum lock attempts.
    pub fn with_lock_retry_attempts(mut self, attempts: u32) -> Self {
        self.lock_retry_attempts = attempts;
        self
    }

    /// Set the initial lock backoff.
    pub fn with_lock_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.lock_retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the free balance default timeout.
    pub fn with_free_balance_default_timeout(mut self, timeout: u64) -> Self {
        self.free_balance_default_timeout = timeout;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn lock_backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.lock_retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            lock_retry_attempts: LOCK_RETRY_ATTEMPTS,
            lock_retry_backoff_ms: LOCK_RETRY_BACKOFF_MS,
            free_balance_default_timeout: FREE_BALANCE_DEFAULT_TIMEOUT,
            nonce_expiry: NONCE_EXPIRY,
        }
    }
}
