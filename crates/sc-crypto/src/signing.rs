//! Recoverable secp256k1 signatures.
//!
//! Commitments are signed over a raw 32-byte digest and verified by
//! recovering the signer address, the way the on-chain contracts do with
//! `ecrecover`. Signatures are 65 bytes: `r ‖ s ‖ v` with `v` in `{27, 28}`.

use std::fmt;
use std::sync::LazyLock;

use rand::RngCore;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::{address_from_public_key, Address, H256};

pub(crate) static SECP256K1: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Errors that can occur during signing or recovery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The provided key bytes are invalid.
    #[error("Invalid key bytes: {0}")]
    InvalidKey(String),

    /// The signature bytes are malformed.
    #[error("Invalid signature bytes: {0}")]
    InvalidSignature(String),

    /// The recovery byte is not 0, 1, 27 or 28.
    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    /// Public key recovery failed.
    #[error("Signer recovery failed")]
    RecoveryFailed,
}

/// A 65-byte recoverable ECDSA signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 65]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != 65 {
            return Err(SignatureError::InvalidSignature(format!(
                "Expected 65 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 65];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }

    /// Recover the address that produced this signature over `digest`.
    pub fn recover(&self, digest: &H256) -> Result<Address, SignatureError> {
        recover_address(digest, self)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map_err(serde::de::Error::custom)?;
        Signature::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A secp256k1 keypair able to sign digests.
///
/// # Example
/// ```
/// use sc_crypto::keccak::keccak256;
/// use sc_crypto::signing::Secp256k1Keypair;
///
/// let keypair = Secp256k1Keypair::generate();
/// let digest = keccak256(b"commitment");
/// let signature = keypair.sign_digest(&digest);
/// assert_eq!(signature.recover(&digest).unwrap(), keypair.address());
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secp256k1Keypair {
    /// Raw private key, zeroized on drop.
    private_key: [u8; 32],
    #[zeroize(skip)]
    public_key: PublicKey,
    #[zeroize(skip)]
    secret_key: SecretKey,
}

impl Secp256k1Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut candidate = [0u8; 32];
            rng.fill_bytes(&mut candidate);
            if let Ok(keypair) = Self::from_private_key(candidate) {
                return keypair;
            }
        }
    }

    /// Create a keypair from a 32-byte private key.
    ///
    /// # Errors
    /// Returns an error if the scalar is zero or not below the curve order.
    pub fn from_private_key(private_key: [u8; 32]) -> Result<Self, SignatureError> {
        let secret_key = SecretKey::from_slice(&private_key)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub(crate) fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);
        Self {
            private_key: secret_key.secret_bytes(),
            public_key,
            secret_key,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key_bytes(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key)
    }

    /// Sign a 32-byte digest. Signing is deterministic (RFC 6979), so the
    /// same key and digest always produce the same signature.
    pub fn sign_digest(&self, digest: &H256) -> Signature {
        let message = Message::from_digest(digest.0);
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, &self.secret_key);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = 27 + recovery_id.to_i32() as u8;
        Signature(bytes)
    }
}

impl fmt::Debug for Secp256k1Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secp256k1Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Recover the signer address of `signature` over `digest`.
///
/// # Errors
/// Returns an error if the signature is malformed or does not recover to a
/// valid public key.
pub fn recover_address(digest: &H256, signature: &Signature) -> Result<Address, SignatureError> {
    let v = signature.v();
    let recovery = match v {
        27 | 28 => v - 27,
        0 | 1 => v,
        other => return Err(SignatureError::InvalidRecoveryId(other)),
    };
    let recovery_id = RecoveryId::from_i32(i32::from(recovery))
        .map_err(|_| SignatureError::InvalidRecoveryId(v))?;
    let recoverable = RecoverableSignature::from_compact(&signature.0[..64], recovery_id)
        .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
    let message = Message::from_digest(digest.0);
    let public_key = SECP256K1
        .recover_ecdsa(&message, &recoverable)
        .map_err(|_| SignatureError::RecoveryFailed)?;
    Ok(address_from_public_key(&public_key))
}

/// Concatenate signatures ordered by their recovered signer address.
///
/// Multisig and app-registry contracts require signatures sorted by signer so
/// that they can check for duplicates in a single pass.
pub fn signatures_to_sorted_bytes(
    signatures: &[Signature],
    digest: &H256,
) -> Result<Vec<u8>, SignatureError> {
    let mut with_signers = signatures
        .iter()
        .map(|sig| recover_address(digest, sig).map(|addr| (addr, *sig)))
        .collect::<Result<Vec<_>, _>>()?;
    with_signers.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(with_signers.len() * 65);
    for (_, sig) in with_signers {
        out.extend_from_slice(sig.as_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keccak::keccak256;

    #[test]
    fn test_sign_and_recover() {
        let keypair = Secp256k1Keypair::generate();
        let digest = keccak256(b"hash to sign");
        let signature = keypair.sign_digest(&digest);
        assert!(signature.v() == 27 || signature.v() == 28);
        assert_eq!(recover_address(&digest, &signature).unwrap(), keypair.address());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let keypair = Secp256k1Keypair::from_private_key([3u8; 32]).unwrap();
        let digest = keccak256(b"same input");
        assert_eq!(keypair.sign_digest(&digest), keypair.sign_digest(&digest));
    }

    #[test]
    fn test_wrong_digest_recovers_other_address() {
        let keypair = Secp256k1Keypair::generate();
        let signature = keypair.sign_digest(&keccak256(b"one"));
        let recovered = recover_address(&keccak256(b"two"), &signature);
        assert_ne!(recovered.ok(), Some(keypair.address()));
    }

    #[test]
    fn test_invalid_recovery_byte() {
        let keypair = Secp256k1Keypair::generate();
        let digest = keccak256(b"x");
        let mut bytes = *keypair.sign_digest(&digest).as_bytes();
        bytes[64] = 5;
        assert_eq!(
            recover_address(&digest, &Signature::from_bytes(bytes)),
            Err(SignatureError::InvalidRecoveryId(5))
        );
    }

    #[test]
    fn test_zero_private_key_rejected() {
        assert!(Secp256k1Keypair::from_private_key([0u8; 32]).is_err());
    }

    #[test]
    fn test_sorted_signature_bytes() {
        let a = Secp256k1Keypair::generate();
        let b = Secp256k1Keypair::generate();
        let digest = keccak256(b"multisig");
        let sig_a = a.sign_digest(&digest);
        let sig_b = b.sign_digest(&digest);

        let forward = signatures_to_sorted_bytes(&[sig_a, sig_b], &digest).unwrap();
        let backward = signatures_to_sorted_bytes(&[sig_b, sig_a], &digest).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 130);

        let first = if a.address() < b.address() { sig_a } else { sig_b };
        assert_eq!(&forward[..65], first.as_bytes());
    }

    #[test]
    fn test_signature_serde() {
        let keypair = Secp256k1Keypair::generate();
        let sig = keypair.sign_digest(&keccak256(b"serde"));
        let json = serde_json::to_string(&sig).unwrap();
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);
    }
}
