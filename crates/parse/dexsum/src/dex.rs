//! Dex header parsing.
//!
//! Only the leading fields are read: magic, version, and the adler32
//! checksum that covers the rest of the file.

use crate::{DexsumError, le_u32};

/// Dex magic bytes: `dex\n`.
pub(crate) const DEX_MAGIC: [u8; 4] = *b"dex\n";

/// Number of leading bytes needed to read the checksum (magic, version, checksum).
pub const DEX_HEADER_PREFIX_SIZE: usize = 12;

/// Offset of the adler32 checksum field.
const CHECKSUM_OFFSET: usize = 8;

/// The leading fields of a dex file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DexHeader {
    /// Three ASCII digits, e.g. `*b"035"`.
    pub version: [u8; 3],
    /// Adler32 checksum of everything after this field.
    pub checksum: u32,
}

impl DexHeader {
    /// Parse the header prefix of a dex file.
    ///
    /// # Errors
    ///
    /// Returns [`DexsumError::Truncated`] if fewer than
    /// [`DEX_HEADER_PREFIX_SIZE`] bytes are given and
    /// [`DexsumError::BadMagic`] if the magic or version terminator is wrong.
    pub fn parse(data: &[u8]) -> Result<Self, DexsumError> {
        if data.len() < DEX_HEADER_PREFIX_SIZE {
            return Err(DexsumError::Truncated);
        }
        if data[..4] != DEX_MAGIC || data[7] != 0 {
            return Err(DexsumError::BadMagic);
        }

        let mut version = [0u8; 3];
        version.copy_from_slice(&data[4..7]);

        Ok(Self {
            version,
            checksum: le_u32(data, CHECKSUM_OFFSET),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a dex header prefix carrying `checksum`.
    pub(crate) fn make_dex(checksum: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DEX_MAGIC);
        buf.extend_from_slice(b"039\0");
        buf.extend_from_slice(&checksum.to_le_bytes());
        // Signature and the rest of the header are irrelevant here.
        buf.extend_from_slice(&[0u8; 20]);
        buf
    }

    #[test]
    fn parse_reads_checksum_and_version() {
        let hdr = DexHeader::parse(&make_dex(0xdead_beef)).expect("valid dex");
        assert_eq!(hdr.checksum, 0xdead_beef);
        assert_eq!(&hdr.version, b"039");
    }

    #[test]
    fn parse_rejects_truncated_header() {
        let buf = make_dex(1);
        assert_eq!(DexHeader::parse(&buf[..11]), Err(DexsumError::Truncated));
    }

    #[test]
    fn parse_rejects_missing_version_terminator() {
        let mut buf = make_dex(1);
        buf[7] = b'x';
        assert_eq!(DexHeader::parse(&buf), Err(DexsumError::BadMagic));
    }
}
