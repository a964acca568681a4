//! ABI writer
//!
//! Serializes [`Token`]s using the standard head/tail layout
//! (`abi.encode`) or the tightly packed layout (`abi.encodePacked`).

use sc_crypto::Address;

use crate::token::Token;
use crate::{AbiError, AbiResult, WORD_SIZE};

/// ABI writer accumulating encoded bytes.
///
/// All integers are big-endian and occupy full 32-byte words in the standard
/// layout.
#[derive(Debug, Clone, Default)]
pub struct AbiWriter {
    buffer: Vec<u8>,
}

impl AbiWriter {
    #[inline]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    // ========================================================================
    // Words
    // ========================================================================

    /// Write a raw 32-byte word.
    #[inline]
    pub fn write_word(&mut self, word: &[u8; WORD_SIZE]) {
        self.buffer.extend_from_slice(word);
    }

    /// Write an unsigned integer as a left-padded word.
    #[inline]
    pub fn write_uint(&mut self, value: u128) {
        let mut word = [0u8; WORD_SIZE];
        word[16..].copy_from_slice(&value.to_be_bytes());
        self.write_word(&word);
    }

    #[inline]
    pub fn write_address(&mut self, address: &Address) {
        self.write_word(&address.to_word());
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.write_uint(u128::from(value));
    }

    /// Write bytes right-padded with zeros to a word boundary.
    pub fn write_padded(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        let padding = (WORD_SIZE - data.len() % WORD_SIZE) % WORD_SIZE;
        self.buffer.extend(std::iter::repeat_n(0, padding));
    }

    /// Write dynamic `bytes`: length word, then padded data.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.write_uint(data.len() as u128);
        self.write_padded(data);
    }

    /// Write raw bytes without length or padding.
    #[inline]
    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Write a sequence of tokens as a standard ABI tuple body.
    ///
    /// Static values are written in place; dynamic values leave an offset in
    /// the head and their content in the tail.
    pub fn write_tokens(&mut self, tokens: &[Token]) -> AbiResult<()> {
        let head_len: usize = tokens.iter().map(Token::head_len).sum();
        let mut tail = AbiWriter::new();

        for token in tokens {
            if token.is_dynamic() {
                self.write_uint((head_len + tail.len()) as u128);
                tail.write_token_body(token)?;
            } else {
                self.write_token_body(token)?;
            }
        }

        self.buffer.extend_from_slice(&tail.buffer);
        Ok(())
    }

    fn write_token_body(&mut self, token: &Token) -> AbiResult<()> {
        match token {
            Token::Address(address) => self.write_address(address),
            Token::Uint(value) => self.write_uint(*value),
            Token::Uint8(value) => self.write_uint(u128::from(*value)),
            Token::Bool(value) => self.write_bool(*value),
            Token::Bytes32(hash) => self.write_word(&hash.0),
            Token::FixedBytes(bytes) => {
                if bytes.is_empty() || bytes.len() > WORD_SIZE {
                    return Err(AbiError::InvalidFixedBytes(bytes.len()));
                }
                self.write_padded(bytes);
            }
            Token::Bytes(bytes) => self.write_bytes(bytes),
            Token::Array(items) => {
                self.write_uint(items.len() as u128);
                self.write_tokens(items)?;
            }
            Token::Tuple(members) => self.write_tokens(members)?,
        }
        Ok(())
    }

    /// Write tokens in `abi.encodePacked` layout.
    ///
    /// Values take their natural width; array elements are still padded to a
    /// full word, as Solidity does. Tuples cannot be packed.
    pub fn write_packed(&mut self, tokens: &[Token]) -> AbiResult<()> {
        for token in tokens {
            match token {
                Token::Address(address) => self.write_raw(address.as_bytes()),
                Token::Uint(value) => self.write_uint(*value),
                Token::Uint8(value) => self.buffer.push(*value),
                Token::Bool(value) => self.buffer.push(u8::from(*value)),
                Token::Bytes32(hash) => self.write_raw(&hash.0),
                Token::FixedBytes(bytes) => {
                    if bytes.is_empty() || bytes.len() > WORD_SIZE {
                        return Err(AbiError::InvalidFixedBytes(bytes.len()));
                    }
                    self.write_raw(bytes);
                }
                Token::Bytes(bytes) => self.write_raw(bytes),
                Token::Array(items) => {
                    for item in items {
                        if item.is_dynamic() {
                            return Err(AbiError::Unpackable("nested dynamic array element"));
                        }
                        self.write_token_body(item)?;
                    }
                }
                Token::Tuple(_) => return Err(AbiError::Unpackable("tuple")),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Buffer Access
    // ========================================================================

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_crypto::H256;

    #[test]
    fn test_write_uint_word() {
        let mut writer = AbiWriter::new();
        writer.write_uint(0x1234);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[30..], &[0x12, 0x34]);
        assert!(bytes[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_dynamic_bytes_layout() {
        // abi.encode(uint256 1, bytes 0xabcd)
        let mut writer = AbiWriter::new();
        writer
            .write_tokens(&[Token::Uint(1), Token::Bytes(vec![0xab, 0xcd])])
            .unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 32 * 4);
        assert_eq!(bytes[31], 1);
        assert_eq!(bytes[63], 0x40); // offset to tail
        assert_eq!(bytes[95], 2); // length
        assert_eq!(&bytes[96..98], &[0xab, 0xcd]);
    }

    #[test]
    fn test_address_array_layout() {
        let a = Address([0x11; 20]);
        let b = Address([0x22; 20]);
        let mut writer = AbiWriter::new();
        writer.write_tokens(&[Token::addresses(&[a, b])]).unwrap();
        let bytes = writer.into_bytes();
        // offset, length, two elements
        assert_eq!(bytes.len(), 32 * 4);
        assert_eq!(bytes[31], 0x20);
        assert_eq!(bytes[63], 2);
        assert_eq!(&bytes[76..96], a.as_bytes());
        assert_eq!(&bytes[108..128], b.as_bytes());
    }

    #[test]
    fn test_packed_widths() {
        let mut writer = AbiWriter::new();
        writer
            .write_packed(&[
                Token::FixedBytes(vec![0x19]),
                Token::Address(Address([0xaa; 20])),
                Token::Uint(5),
                Token::Bytes32(H256([0xbb; 32])),
                Token::Uint8(1),
            ])
            .unwrap();
        assert_eq!(writer.len(), 1 + 20 + 32 + 32 + 1);
        assert_eq!(writer.as_bytes()[0], 0x19);
    }

    #[test]
    fn test_packed_rejects_tuple() {
        let mut writer = AbiWriter::new();
        assert!(writer.write_packed(&[Token::Tuple(vec![])]).is_err());
    }

    #[test]
    fn test_fixed_bytes_bounds() {
        let mut writer = AbiWriter::new();
        assert!(writer.write_tokens(&[Token::FixedBytes(vec![0; 33])]).is_err());
    }
}
