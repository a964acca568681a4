//! Keccak-256 hashing.
//!
//! Ethereum uses the original Keccak padding rather than the finalized
//! SHA3-256 one, so every commitment hash, identity hash and address in this
//! workspace goes through [`keccak256`].

use sha3::{Digest, Keccak256};

use crate::address::H256;

/// Compute the Keccak-256 hash of the input data.
///
/// # Example
/// ```
/// use sc_crypto::keccak::keccak256;
///
/// let hash = keccak256(b"");
/// assert_eq!(
///     hash.to_string(),
///     "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
/// );
/// ```
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256(hasher.finalize().into())
}

/// Compute the Keccak-256 hash of several slices as if they were concatenated.
///
/// # Example
/// ```
/// use sc_crypto::keccak::{keccak256, keccak256_multi};
///
/// assert_eq!(keccak256_multi(&[b"state", b"channel"]), keccak256(b"statechannel"));
/// ```
pub fn keccak256_multi(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    H256(hasher.finalize().into())
}

/// Streaming Keccak-256 hasher.
pub struct Keccak256Hasher {
    inner: Keccak256,
}

impl Keccak256Hasher {
    pub fn new() -> Self {
        Self {
            inner: Keccak256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> H256 {
        H256(self.inner.finalize().into())
    }
}

impl Default for Keccak256Hasher {
    fn default() -> Self {
        Self::new()
    }
}
