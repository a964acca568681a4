//! Extended keys and per-index signing addresses.
//!
//! Every participant is identified by an extended public key ("xpub"). The
//! signing key for a given app is the non-hardened child of that xpub at the
//! app's sequence number, so any peer can derive the address it expects a
//! signature from without further key exchange. Index 0 is the multisig
//! owner key.
//!
//! Derivation follows BIP-32 public derivation:
//!
//! ```text
//! I      = HMAC-SHA512(chain_code, serP(K_parent) ‖ ser32(index))
//! K_i    = K_parent + I[..32]·G
//! c_i    = I[32..]
//! ```
//!
//! The text form is `xpub` followed by the hex of the chain code and the
//! compressed public key.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use secp256k1::{PublicKey, Scalar, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use zeroize::Zeroize;

use crate::address::{address_from_public_key, Address};
use crate::kdf::hmac_sha512;
use crate::signing::{Secp256k1Keypair, SECP256K1};

/// First index reserved for hardened derivation.
pub const HARDENED_OFFSET: u64 = 1 << 31;

const XPUB_PREFIX: &str = "xpub";
const MASTER_KEY_DOMAIN: &[u8] = b"Bitcoin seed";

/// Errors from extended-key operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XKeyError {
    /// Child index is in the hardened range, which public derivation cannot reach.
    #[error("Index {0} is not a non-hardened child index")]
    HardenedIndex(u64),

    /// Derivation produced an invalid key (probability ~2^-127).
    #[error("Derived key is invalid at index {0}")]
    InvalidChild(u64),

    /// Key material could not be parsed.
    #[error("Invalid extended key: {0}")]
    InvalidKey(String),
}

fn child_tweak(
    chain_code: &[u8; 32],
    parent: &PublicKey,
    index: u64,
) -> Result<(Scalar, [u8; 32]), XKeyError> {
    if index >= HARDENED_OFFSET {
        return Err(XKeyError::HardenedIndex(index));
    }
    let mut data = Vec::with_capacity(33 + 4);
    data.extend_from_slice(&parent.serialize());
    data.extend_from_slice(&(index as u32).to_be_bytes());

    let mut mac = hmac_sha512(chain_code, &data);
    let mut left = [0u8; 32];
    left.copy_from_slice(&mac[..32]);
    let mut child_chain = [0u8; 32];
    child_chain.copy_from_slice(&mac[32..]);
    mac.zeroize();

    let tweak = Scalar::from_be_bytes(left).map_err(|_| XKeyError::InvalidChild(index))?;
    left.zeroize();
    Ok((tweak, child_chain))
}

/// An extended private key: a secret scalar plus chain code.
#[derive(Clone)]
pub struct ExtendedPrivateKey {
    secret_key: SecretKey,
    chain_code: [u8; 32],
}

impl ExtendedPrivateKey {
    /// Generate a random master key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            let result = Self::from_seed(&seed);
            seed.zeroize();
            if let Ok(key) = result {
                return key;
            }
        }
    }

    /// Derive the master key from seed bytes.
    ///
    /// # Errors
    /// Returns an error in the negligible case that the seed maps to an
    /// invalid scalar.
    pub fn from_seed(seed: &[u8]) -> Result<Self, XKeyError> {
        let mut mac = hmac_sha512(MASTER_KEY_DOMAIN, seed);
        let secret_key = SecretKey::from_slice(&mac[..32])
            .map_err(|e| XKeyError::InvalidKey(e.to_string()));
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&mac[32..]);
        mac.zeroize();
        Ok(Self {
            secret_key: secret_key?,
            chain_code,
        })
    }

    /// The public counterpart of this key.
    pub fn neuter(&self) -> ExtendedPublicKey {
        ExtendedPublicKey {
            public_key: PublicKey::from_secret_key(&SECP256K1, &self.secret_key),
            chain_code: self.chain_code,
        }
    }

    /// Derive the non-hardened child at `index`.
    pub fn derive_child(&self, index: u64) -> Result<Self, XKeyError> {
        let parent_public = PublicKey::from_secret_key(&SECP256K1, &self.secret_key);
        let (tweak, chain_code) = child_tweak(&self.chain_code, &parent_public, index)?;
        let secret_key = self
            .secret_key
            .add_tweak(&tweak)
            .map_err(|_| XKeyError::InvalidChild(index))?;
        Ok(Self {
            secret_key,
            chain_code,
        })
    }

    /// The signing keypair at `index`.
    pub fn kth_keypair(&self, index: u64) -> Result<Secp256k1Keypair, XKeyError> {
        let child = self.derive_child(index)?;
        Ok(Secp256k1Keypair::from_secret_key(child.secret_key))
    }
}

impl Drop for ExtendedPrivateKey {
    fn drop(&mut self) {
        self.chain_code.zeroize();
        self.secret_key.non_secure_erase();
    }
}

impl fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivateKey")
            .field("xpub", &self.neuter())
            .finish_non_exhaustive()
    }
}

/// An extended public key identifying a participant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtendedPublicKey {
    public_key: PublicKey,
    chain_code: [u8; 32],
}

impl ExtendedPublicKey {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Derive the non-hardened child at `index`.
    pub fn derive_child(&self, index: u64) -> Result<Self, XKeyError> {
        let (tweak, chain_code) = child_tweak(&self.chain_code, &self.public_key, index)?;
        let public_key = self
            .public_key
            .add_exp_tweak(&SECP256K1, &tweak)
            .map_err(|_| XKeyError::InvalidChild(index))?;
        Ok(Self {
            public_key,
            chain_code,
        })
    }

    /// Address of the child key at `index`.
    pub fn kth_address(&self, index: u64) -> Result<Address, XKeyError> {
        Ok(address_from_public_key(&self.derive_child(index)?.public_key))
    }

    /// Owner address (child 0).
    pub fn owner_address(&self) -> Result<Address, XKeyError> {
        self.kth_address(0)
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            XPUB_PREFIX,
            hex::encode(self.chain_code),
            hex::encode(self.public_key.serialize())
        )
    }
}

impl fmt::Debug for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_string();
        // chain code is not secret but makes logs unreadable
        write!(f, "ExtendedPublicKey({}…)", &text[..16])
    }
}

impl FromStr for ExtendedPublicKey {
    type Err = XKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(XPUB_PREFIX)
            .ok_or_else(|| XKeyError::InvalidKey("missing xpub prefix".to_string()))?;
        let bytes = hex::decode(body).map_err(|e| XKeyError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 + 33 {
            return Err(XKeyError::InvalidKey(format!(
                "Expected 65 bytes, got {}",
                bytes.len()
            )));
        }
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[..32]);
        let public_key = PublicKey::from_slice(&bytes[32..])
            .map_err(|e| XKeyError::InvalidKey(e.to_string()))?;
        Ok(Self {
            public_key,
            chain_code,
        })
    }
}

impl Serialize for ExtendedPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExtendedPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address of `xpub`'s child at `index`.
pub fn xkey_kth_address(xpub: &ExtendedPublicKey, index: u64) -> Result<Address, XKeyError> {
    xpub.kth_address(index)
}

/// Child addresses of several xpubs at `index`, sorted ascending.
pub fn xkeys_to_sorted_kth_addresses(
    xpubs: &[ExtendedPublicKey],
    index: u64,
) -> Result<Vec<Address>, XKeyError> {
    let mut addresses = xpubs
        .iter()
        .map(|xpub| xpub.kth_address(index))
        .collect::<Result<Vec<_>, _>>()?;
    addresses.sort();
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keccak::keccak256;

    #[test]
    fn test_public_and_private_derivation_agree() {
        let xprv = ExtendedPrivateKey::generate();
        let xpub = xprv.neuter();
        for index in [0u64, 1, 2, 17, 1000] {
            let from_private = xprv.kth_keypair(index).unwrap().address();
            let from_public = xpub.kth_address(index).unwrap();
            assert_eq!(from_private, from_public, "index {index}");
        }
    }

    #[test]
    fn test_distinct_indices_give_distinct_addresses() {
        let xpub = ExtendedPrivateKey::generate().neuter();
        assert_ne!(xpub.kth_address(1).unwrap(), xpub.kth_address(2).unwrap());
    }

    #[test]
    fn test_hardened_index_rejected() {
        let xpub = ExtendedPrivateKey::generate().neuter();
        assert_eq!(
            xpub.kth_address(HARDENED_OFFSET),
            Err(XKeyError::HardenedIndex(HARDENED_OFFSET))
        );
    }

    #[test]
    fn test_seeded_key_is_deterministic() {
        let a = ExtendedPrivateKey::from_seed(b"fixed seed").unwrap();
        let b = ExtendedPrivateKey::from_seed(b"fixed seed").unwrap();
        assert_eq!(a.neuter(), b.neuter());
    }

    #[test]
    fn test_xpub_text_roundtrip() {
        let xpub = ExtendedPrivateKey::generate().neuter();
        let text = xpub.to_string();
        assert!(text.starts_with("xpub"));
        let parsed: ExtendedPublicKey = text.parse().unwrap();
        assert_eq!(parsed, xpub);
        assert!("xpub00".parse::<ExtendedPublicKey>().is_err());
        assert!("nope".parse::<ExtendedPublicKey>().is_err());
    }

    #[test]
    fn test_child_key_signs_for_derived_address() {
        let xprv = ExtendedPrivateKey::generate();
        let keypair = xprv.kth_keypair(5).unwrap();
        let digest = keccak256(b"app update");
        let sig = keypair.sign_digest(&digest);
        assert_eq!(
            sig.recover(&digest).unwrap(),
            xkey_kth_address(&xprv.neuter(), 5).unwrap()
        );
    }

    #[test]
    fn test_sorted_kth_addresses() {
        let a = ExtendedPrivateKey::generate().neuter();
        let b = ExtendedPrivateKey::generate().neuter();
        let sorted = xkeys_to_sorted_kth_addresses(&[a, b], 3).unwrap();
        assert!(sorted[0] < sorted[1]);
    }
}
