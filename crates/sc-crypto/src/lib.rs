//! State-channel cryptography.
//!
//! This crate provides the primitives every commitment in a state channel is
//! built from:
//!
//! - **Keccak-256**: commitment digests, identity hashes and addresses
//! - **secp256k1**: recoverable signatures verified by signer recovery
//! - **Addresses**: 20-byte Ethereum addresses derived from public keys
//! - **Extended keys**: per-app signing addresses derived by index from a
//!   participant's xpub
//!
//! # Overview
//!
//! A participant holds one [`ExtendedPrivateKey`] and publishes its
//! [`ExtendedPublicKey`]. The key at index 0 owns the channel multisig; an
//! app installed with sequence number `n` is signed with the key at index `n`.
//! Counterparties check signatures by recovering the signer over the
//! commitment's hash and comparing with the address they derive themselves.
//!
//! # Example
//!
//! ```
//! use sc_crypto::{keccak256, recover_address, ExtendedPrivateKey};
//!
//! let alice = ExtendedPrivateKey::generate();
//! let alice_xpub = alice.neuter();
//!
//! // Alice signs with the key for app sequence number 2
//! let digest = keccak256(b"set state");
//! let signature = alice.kth_keypair(2).unwrap().sign_digest(&digest);
//!
//! // Bob derives the expected signer from the xpub alone
//! let expected = alice_xpub.kth_address(2).unwrap();
//! assert_eq!(recover_address(&digest, &signature).unwrap(), expected);
//! ```

pub mod address;
pub mod kdf;
pub mod keccak;
pub mod signing;
pub mod xkey;

pub use address::{address_from_public_key, sort_addresses, Address, ParseHexError, H256};
pub use kdf::hmac_sha512;
pub use keccak::{keccak256, keccak256_multi, Keccak256Hasher};
pub use signing::{
    recover_address, signatures_to_sorted_bytes, Secp256k1Keypair, Signature, SignatureError,
};
pub use xkey::{
    xkey_kth_address, xkeys_to_sorted_kth_addresses, ExtendedPrivateKey, ExtendedPublicKey,
    XKeyError,
};

/// Generate a cryptographically secure random 32-byte array.
pub fn random_bytes_32() -> [u8; 32] {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random address, used for fresh multisig addresses in tests and
/// tooling.
pub fn random_address() -> Address {
    let bytes = random_bytes_32();
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[..20]);
    Address(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_signing_flow() {
        let alice = ExtendedPrivateKey::generate();
        let bob = ExtendedPrivateKey::generate();

        let owners = xkeys_to_sorted_kth_addresses(&[alice.neuter(), bob.neuter()], 0).unwrap();
        assert!(owners[0] < owners[1]);

        let digest = keccak256(b"commitment");
        let sig_a = alice.kth_keypair(0).unwrap().sign_digest(&digest);
        let sig_b = bob.kth_keypair(0).unwrap().sign_digest(&digest);

        let packed = signatures_to_sorted_bytes(&[sig_b, sig_a], &digest).unwrap();
        let first = Signature::from_slice(&packed[..65]).unwrap();
        assert_eq!(first.recover(&digest).unwrap(), owners[0]);
    }

    #[test]
    fn test_random_bytes() {
        assert_ne!(random_bytes_32(), random_bytes_32());
        assert_ne!(random_address(), random_address());
    }
}
