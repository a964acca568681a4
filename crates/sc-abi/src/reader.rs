//! ABI reader
//!
//! Decodes standard-layout ABI data word by word. Used to read app states
//! (which are ABI-encoded structs) and to inspect encoded calldata.

use sc_crypto::{Address, H256};

use crate::{AbiError, AbiResult, WORD_SIZE};

/// ABI reader over a byte slice.
///
/// Reads advance a cursor; dynamic values are followed through their head
/// offset, which is relative to `base`.
#[derive(Debug, Clone)]
pub struct AbiReader<'a> {
    data: &'a [u8],
    position: usize,
    base: usize,
}

impl<'a> AbiReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            base: 0,
        }
    }

    /// Current cursor position.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    fn slice_at(&self, offset: usize, len: usize) -> AbiResult<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(AbiError::UnexpectedEof { needed: len, available: 0 })?;
        if end > self.data.len() {
            return Err(AbiError::UnexpectedEof {
                needed: len,
                available: self.data.len().saturating_sub(offset),
            });
        }
        Ok(&self.data[offset..end])
    }

    /// Read the 4-byte function selector at the start of calldata.
    pub fn read_selector(&mut self) -> AbiResult<[u8; 4]> {
        let bytes = self.slice_at(self.position, 4)?;
        self.position += 4;
        self.base = self.position;
        let mut selector = [0u8; 4];
        selector.copy_from_slice(bytes);
        Ok(selector)
    }

    /// Read one raw 32-byte word.
    pub fn read_word(&mut self) -> AbiResult<[u8; WORD_SIZE]> {
        let bytes = self.slice_at(self.position, WORD_SIZE)?;
        self.position += WORD_SIZE;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(bytes);
        Ok(word)
    }

    /// Read a `uint256` that must fit in 128 bits.
    pub fn read_uint(&mut self) -> AbiResult<u128> {
        let word = self.read_word()?;
        word_to_uint(&word)
    }

    pub fn read_uint8(&mut self) -> AbiResult<u8> {
        let value = self.read_uint()?;
        u8::try_from(value).map_err(|_| AbiError::Overflow)
    }

    pub fn read_bool(&mut self) -> AbiResult<bool> {
        match self.read_uint()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(AbiError::InvalidBool),
        }
    }

    pub fn read_address(&mut self) -> AbiResult<Address> {
        let word = self.read_word()?;
        if word[..12].iter().any(|b| *b != 0) {
            return Err(AbiError::InvalidAddress);
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&word[12..]);
        Ok(Address(out))
    }

    pub fn read_bytes32(&mut self) -> AbiResult<H256> {
        Ok(H256(self.read_word()?))
    }

    /// Read dynamic `bytes` by following the head offset.
    pub fn read_bytes(&mut self) -> AbiResult<Vec<u8>> {
        let offset = usize::try_from(self.read_uint()?).map_err(|_| AbiError::Overflow)?;
        let start = self.base.checked_add(offset).ok_or(AbiError::Overflow)?;
        let len_word = self.slice_at(start, WORD_SIZE)?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(len_word);
        let len = usize::try_from(word_to_uint(&word)?).map_err(|_| AbiError::Overflow)?;
        Ok(self.slice_at(start + WORD_SIZE, len)?.to_vec())
    }

    /// Read an `address[]` by following the head offset.
    pub fn read_address_array(&mut self) -> AbiResult<Vec<Address>> {
        let offset = usize::try_from(self.read_uint()?).map_err(|_| AbiError::Overflow)?;
        let start = self.base.checked_add(offset).ok_or(AbiError::Overflow)?;
        let mut nested = AbiReader {
            data: self.data,
            position: start,
            base: start + WORD_SIZE,
        };
        let len = usize::try_from(nested.read_uint()?).map_err(|_| AbiError::Overflow)?;
        (0..len).map(|_| nested.read_address()).collect()
    }
}

fn word_to_uint(word: &[u8; WORD_SIZE]) -> AbiResult<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow);
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}
