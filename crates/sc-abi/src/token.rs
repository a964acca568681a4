//! ABI values.

use sc_crypto::{Address, H256};

/// A Solidity value ready for encoding.
///
/// Only the shapes commitments actually use are modelled. Integers wider
/// than 128 bits never occur in channel balances or nonces, so `Uint` holds a
/// `u128` and is widened to a 256-bit word on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `address`
    Address(Address),
    /// `uint256`
    Uint(u128),
    /// `uint8`; packs to a single byte.
    Uint8(u8),
    /// `bool`
    Bool(bool),
    /// `bytes32`
    Bytes32(H256),
    /// `bytes1` .. `bytes31`; left-aligned in its word.
    FixedBytes(Vec<u8>),
    /// `bytes`
    Bytes(Vec<u8>),
    /// `T[]`
    Array(Vec<Token>),
    /// `tuple(...)`
    Tuple(Vec<Token>),
}

impl Token {
    /// Whether the value is encoded in the tail section (ABI "dynamic").
    pub fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(members) => members.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Size of the value in the head section.
    pub fn head_len(&self) -> usize {
        match self {
            _ if self.is_dynamic() => 32,
            Token::Tuple(members) => members.iter().map(Token::head_len).sum(),
            _ => 32,
        }
    }

    /// Convenience for `address[]`.
    pub fn addresses(addresses: &[Address]) -> Token {
        Token::Array(addresses.iter().copied().map(Token::Address).collect())
    }
}

impl From<Address> for Token {
    fn from(value: Address) -> Self {
        Token::Address(value)
    }
}

impl From<H256> for Token {
    fn from(value: H256) -> Self {
        Token::Bytes32(value)
    }
}

impl From<u128> for Token {
    fn from(value: u128) -> Self {
        Token::Uint(value)
    }
}

impl From<u64> for Token {
    fn from(value: u64) -> Self {
        Token::Uint(u128::from(value))
    }
}

impl From<bool> for Token {
    fn from(value: bool) -> Self {
        Token::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_detection() {
        assert!(!Token::Uint(1).is_dynamic());
        assert!(Token::Bytes(vec![]).is_dynamic());
        assert!(Token::addresses(&[Address::ZERO]).is_dynamic());
        assert!(!Token::Tuple(vec![Token::Uint(1), Token::Bool(true)]).is_dynamic());
        assert!(Token::Tuple(vec![Token::Uint(1), Token::Bytes(vec![1])]).is_dynamic());
    }

    #[test]
    fn test_static_tuple_head_len() {
        let tuple = Token::Tuple(vec![Token::Uint8(0), Token::Uint(1), Token::Address(Address::ZERO)]);
        assert_eq!(tuple.head_len(), 96);
    }
}
