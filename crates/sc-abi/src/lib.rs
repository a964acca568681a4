//! Solidity ABI encoding for state-channel commitments.
//!
//! Commitments are Ethereum transactions whose calldata and signing digests
//! are built from ABI-encoded values. This crate implements the two layouts
//! they need:
//!
//! - **Standard** (`abi.encode`): 32-byte words, dynamic values in a tail
//! - **Packed** (`abi.encodePacked`): natural widths, used for digests
//!
//! plus function selectors and a reader for decoding app states.
//!
//! # Example
//!
//! ```
//! use sc_abi::{encode_function_call, function_selector, Token};
//! use sc_crypto::Address;
//!
//! let selector = function_selector("transfer(address,uint256)");
//! assert_eq!(hex::encode(selector), "a9059cbb");
//!
//! let calldata = encode_function_call(
//!     "transfer(address,uint256)",
//!     &[Token::Address(Address::ZERO), Token::Uint(1)],
//! )
//! .unwrap();
//! assert_eq!(calldata.len(), 4 + 64);
//! ```

pub mod reader;
pub mod token;
pub mod writer;

use thiserror::Error;

use sc_crypto::keccak256;

pub use reader::AbiReader;
pub use token::Token;
pub use writer::AbiWriter;

/// Size of an ABI word.
pub const WORD_SIZE: usize = 32;

/// Errors from ABI encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AbiError {
    #[error("Unexpected end of data: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("Integer does not fit in the target type")]
    Overflow,

    #[error("Address word has non-zero padding")]
    InvalidAddress,

    #[error("Bool word is neither 0 nor 1")]
    InvalidBool,

    #[error("Fixed bytes must be 1..=32 long, got {0}")]
    InvalidFixedBytes(usize),

    #[error("Cannot pack {0}")]
    Unpackable(&'static str),
}

pub type AbiResult<T> = Result<T, AbiError>;

/// First four bytes of the keccak hash of a canonical function signature.
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&hash.0[..4]);
    selector
}

/// `abi.encode(tokens...)`
pub fn encode(tokens: &[Token]) -> AbiResult<Vec<u8>> {
    let mut writer = AbiWriter::with_capacity(tokens.len() * WORD_SIZE);
    writer.write_tokens(tokens)?;
    Ok(writer.into_bytes())
}

/// `abi.encodePacked(tokens...)`
pub fn encode_packed(tokens: &[Token]) -> AbiResult<Vec<u8>> {
    let mut writer = AbiWriter::new();
    writer.write_packed(tokens)?;
    Ok(writer.into_bytes())
}

/// Calldata for a call to `signature` with `args`.
///
/// # Arguments
/// * `signature` - Canonical signature, e.g. `"setNonce(uint256,bytes32,uint256)"`
/// * `args` - Argument values in declaration order
pub fn encode_function_call(signature: &str, args: &[Token]) -> AbiResult<Vec<u8>> {
    let mut writer = AbiWriter::with_capacity(4 + args.len() * WORD_SIZE);
    writer.write_raw(&function_selector(signature));
    writer.write_tokens(args)?;
    Ok(writer.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_crypto::{Address, H256};

    #[test]
    fn test_known_selectors() {
        assert_eq!(
            hex::encode(function_selector("balanceOf(address)")),
            "70a08231"
        );
        assert_eq!(
            hex::encode(function_selector("approve(address,uint256)")),
            "095ea7b3"
        );
    }

    #[test]
    fn test_encode_static_tuple_is_flat() {
        let flat = encode(&[Token::Uint(1), Token::Uint(2)]).unwrap();
        let nested = encode(&[Token::Tuple(vec![Token::Uint(1), Token::Uint(2)])]).unwrap();
        assert_eq!(flat, nested);
    }

    #[test]
    fn test_encode_dynamic_tuple_uses_offset() {
        let encoded = encode(&[Token::Tuple(vec![
            Token::Address(Address::ZERO),
            Token::Bytes(vec![1]),
        ])])
        .unwrap();
        // outer offset, address, inner offset, length, data
        assert_eq!(encoded.len(), 32 * 5);
        assert_eq!(encoded[31], 0x20);
        assert_eq!(encoded[95], 0x40);
    }

    #[test]
    fn test_packed_hash_input() {
        let packed = encode_packed(&[
            Token::FixedBytes(vec![0x19]),
            Token::Bytes32(H256([1; 32])),
            Token::Uint(3),
        ])
        .unwrap();
        assert_eq!(packed.len(), 65);
        assert_eq!(packed[64], 3);
    }

    #[test]
    fn test_function_call_roundtrip_through_reader() {
        let calldata = encode_function_call(
            "setNonce(uint256,bytes32,uint256)",
            &[
                Token::Uint(0),
                Token::Bytes32(H256([7; 32])),
                Token::Uint(1),
            ],
        )
        .unwrap();
        let mut reader = AbiReader::new(&calldata);
        assert_eq!(
            reader.read_selector().unwrap(),
            function_selector("setNonce(uint256,bytes32,uint256)")
        );
        assert_eq!(reader.read_uint().unwrap(), 0);
        assert_eq!(reader.read_bytes32().unwrap(), H256([7; 32]));
        assert_eq!(reader.read_uint().unwrap(), 1);
    }
}
