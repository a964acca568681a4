//! HMAC-SHA512, the pseudorandom function behind extended-key derivation.
//!
//! # Example
//!
//! ```
//! use sc_crypto::kdf::hmac_sha512;
//!
//! let mac = hmac_sha512(b"Bitcoin seed", b"seed material");
//! assert_eq!(mac.len(), 64);
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Compute HMAC-SHA512 of `data` under `key`.
///
/// # Returns
/// A 64-byte tag. For key derivation the left half is the tweak scalar and the
/// right half the child chain code.
pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac =
        HmacSha512::new_from_slice(key).expect("HMAC can be initialized with any key length");
    mac.update(data);
    let result = mac.finalize();
    let mut output = [0u8; 64];
    output.copy_from_slice(&result.into_bytes());
    output
}
