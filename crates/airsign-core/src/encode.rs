//! Compact-size integers and a bounds-checked byte reader.
//!
//! All binary formats in the signer (scripts, witnesses, transactions, PSBT
//! key/value maps) are built from these two primitives.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unexpected end of data: needed {needed} bytes, {available} left")]
    UnexpectedEof { needed: usize, available: usize },
    #[error("Non-canonical compact size encoding")]
    NonCanonicalCompactSize,
    #[error("Length {0} does not fit in memory")]
    LengthOverflow(u64),
    #[error("Invalid base58: {0}")]
    Base58(String),
    #[error("Invalid bech32 address: {0}")]
    Bech32(String),
    #[error("Invalid hex: {0}")]
    Hex(String),
}

/// Append a compact-size integer.
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn compact_size(n: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_compact_size(&mut out, n);
    out
}

/// Append `data` prefixed with its compact-size length.
pub fn write_var_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_compact_size(out, data.len() as u64);
    out.extend_from_slice(data);
}

/// Cursor over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Look at the next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnexpectedEof {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32_le(&mut self) -> Result<u32, EncodingError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, EncodingError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_compact_size(&mut self) -> Result<u64, EncodingError> {
        let first = self.read_u8()?;
        let (value, min) = match first {
            0xfd => (u16::from_le_bytes(self.read_array()?) as u64, 0xfd),
            0xfe => (u32::from_le_bytes(self.read_array()?) as u64, 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(EncodingError::NonCanonicalCompactSize);
        }
        Ok(value)
    }

    /// Read a compact-size length followed by that many bytes.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], EncodingError> {
        let len = self.read_compact_size()?;
        let len = usize::try_from(len).map_err(|_| EncodingError::LengthOverflow(len))?;
        self.read_bytes(len)
    }
}

/// Base58Check encode (4-byte double-SHA256 checksum appended).
pub fn base58_encode_check(data: &[u8]) -> String {
    bitcoin::base58::encode_check(data)
}

pub fn base58_decode_check(s: &str) -> Result<Vec<u8>, EncodingError> {
    bitcoin::base58::decode_check(s).map_err(|e| EncodingError::Base58(e.to_string()))
}

/// Plain Base58, no checksum.
pub fn base58_encode(data: &[u8]) -> String {
    bitcoin::base58::encode(data)
}

pub fn base58_decode(s: &str) -> Result<Vec<u8>, EncodingError> {
    bitcoin::base58::decode(s).map_err(|e| EncodingError::Base58(e.to_string()))
}

pub fn hex_decode(s: &str) -> Result<Vec<u8>, EncodingError> {
    hex::decode(s).map_err(|e| EncodingError::Hex(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_boundaries() {
        assert_eq!(compact_size(0xfc), vec![0xfc]);
        assert_eq!(compact_size(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(compact_size(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(compact_size(0x1_0000_0000)[0], 0xff);

        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let bytes = compact_size(n);
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.read_compact_size().unwrap(), n);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_non_canonical_compact_size_rejected() {
        let mut reader = Reader::new(&[0xfd, 0x10, 0x00]);
        assert_eq!(
            reader.read_compact_size(),
            Err(EncodingError::NonCanonicalCompactSize)
        );
    }

    #[test]
    fn test_base58_check_detects_corruption() {
        let encoded = base58_encode_check(&[0x00, 0x01, 0x02]);
        assert_eq!(base58_decode_check(&encoded).unwrap(), vec![0x00, 0x01, 0x02]);

        let mut corrupted: Vec<char> = encoded.chars().collect();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == '1' { '2' } else { '1' };
        let corrupted: String = corrupted.into_iter().collect();
        assert!(base58_decode_check(&corrupted).is_err());
    }

    #[test]
    fn test_reader_eof() {
        let mut reader = Reader::new(&[1, 2, 3]);
        assert!(reader.read_bytes(4).is_err());
        assert_eq!(reader.read_bytes(2).unwrap(), &[1, 2]);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn test_var_bytes_truncated() {
        let mut reader = Reader::new(&[0x05, 0xaa, 0xbb]);
        assert!(matches!(
            reader.read_var_bytes(),
            Err(EncodingError::UnexpectedEof { needed: 5, available: 2 })
        ));
    }
}
