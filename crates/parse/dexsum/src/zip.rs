//! Zip central directory parsing.
//!
//! Jar files store each embedded dex image as a `classes<N>.dex` entry. The
//! central directory already records a CRC-32 for every entry, so reading it
//! is enough to fingerprint the archive without inflating anything.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::{DexsumError, le_u16, le_u32};

/// Local file header signature (`PK\x03\x04`), the first bytes of any archive.
pub(crate) const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;

/// Central directory file header signature (`PK\x01\x02`).
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;

/// End of central directory record signature (`PK\x05\x06`).
const EOCD_SIG: u32 = 0x0605_4b50;

/// Fixed size of the end of central directory record.
const EOCD_SIZE: usize = 22;

/// Fixed size of a central directory file header, before the variable fields.
const CENTRAL_HEADER_SIZE: usize = 46;

/// Bytes from the end of an archive that can hold the EOCD record
/// (fixed part plus the largest possible comment).
pub const EOCD_SEARCH_WINDOW: usize = EOCD_SIZE + u16::MAX as usize;

/// The fields of the end of central directory record that locate the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    /// Total number of central directory entries.
    pub entries: u16,
    /// Size of the central directory in bytes.
    pub cd_size: u32,
    /// Offset of the central directory from the start of the archive.
    pub cd_offset: u32,
}

impl EndOfCentralDirectory {
    /// Locate the record in the trailing bytes of an archive.
    ///
    /// `tail` is usually the last [`EOCD_SEARCH_WINDOW`] bytes (or the whole
    /// file if it is smaller). The scan runs backwards so that a signature
    /// inside the archive comment is not picked up first.
    ///
    /// # Errors
    ///
    /// Returns [`DexsumError::Truncated`] if `tail` cannot hold a record and
    /// [`DexsumError::BadMagic`] if no record is found.
    pub fn find(tail: &[u8]) -> Result<Self, DexsumError> {
        if tail.len() < EOCD_SIZE {
            return Err(DexsumError::Truncated);
        }

        for pos in (0..=tail.len() - EOCD_SIZE).rev() {
            if le_u32(tail, pos) != EOCD_SIG {
                continue;
            }
            let comment_len = usize::from(le_u16(tail, pos + 20));
            if pos + EOCD_SIZE + comment_len > tail.len() {
                continue;
            }
            return Ok(Self {
                entries: le_u16(tail, pos + 10),
                cd_size: le_u32(tail, pos + 12),
                cd_offset: le_u32(tail, pos + 16),
            });
        }

        Err(DexsumError::BadMagic)
    }
}

/// One central directory file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralEntry<'a> {
    /// Raw entry name (usually UTF-8).
    pub name: &'a [u8],
    /// CRC-32 of the uncompressed entry data.
    pub crc32: u32,
    /// Compressed size in bytes.
    pub compressed_size: u32,
    /// Uncompressed size in bytes.
    pub uncompressed_size: u32,
}

/// A parsed view over the central directory bytes.
#[derive(Debug, Clone)]
pub struct CentralDirectory<'a> {
    entries: Vec<CentralEntry<'a>>,
}

impl<'a> CentralDirectory<'a> {
    /// Parse `count` consecutive file headers from the directory bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DexsumError::Truncated`] if a header runs past `data` and
    /// [`DexsumError::BadMagic`] on a bad header signature.
    pub fn parse(data: &'a [u8], count: u16) -> Result<Self, DexsumError> {
        let mut entries = Vec::with_capacity(usize::from(count));
        let mut off = 0usize;

        for _ in 0..count {
            if off + CENTRAL_HEADER_SIZE > data.len() {
                return Err(DexsumError::Truncated);
            }
            if le_u32(data, off) != CENTRAL_HEADER_SIG {
                return Err(DexsumError::BadMagic);
            }

            let name_len = usize::from(le_u16(data, off + 28));
            let extra_len = usize::from(le_u16(data, off + 30));
            let comment_len = usize::from(le_u16(data, off + 32));
            let name_start = off + CENTRAL_HEADER_SIZE;
            let next = name_start + name_len + extra_len + comment_len;
            if next > data.len() {
                return Err(DexsumError::Truncated);
            }

            entries.push(CentralEntry {
                name: &data[name_start..name_start + name_len],
                crc32: le_u32(data, off + 16),
                compressed_size: le_u32(data, off + 20),
                uncompressed_size: le_u32(data, off + 24),
            });
            off = next;
        }

        Ok(Self { entries })
    }

    /// Returns all parsed entries in directory order.
    pub fn entries(&self) -> &[CentralEntry<'a>] {
        &self.entries
    }

    /// Look up an entry by exact name.
    pub fn find(&self, name: &str) -> Option<&CentralEntry<'a>> {
        self.entries.iter().find(|e| e.name == name.as_bytes())
    }

    /// CRC-32 values of `classes.dex`, `classes2.dex`, ... in multidex order.
    ///
    /// Stops at the first missing index, the same way the runtime loads them.
    ///
    /// # Errors
    ///
    /// Returns [`DexsumError::NoDexEntries`] if `classes.dex` is absent.
    pub fn multidex_crcs(&self) -> Result<Vec<u32>, DexsumError> {
        let crcs: Vec<u32> = (0..)
            .map_while(|i| self.find(&multidex_entry_name(i)).map(|e| e.crc32))
            .collect();
        if crcs.is_empty() {
            return Err(DexsumError::NoDexEntries);
        }
        Ok(crcs)
    }
}

/// Entry name of the `index`-th dex image (0-based): `classes.dex`, `classes2.dex`, ...
#[must_use]
pub fn multidex_entry_name(index: usize) -> String {
    if index == 0 {
        String::from("classes.dex")
    } else {
        format!("classes{}.dex", index + 1)
    }
}

/// Extract the multidex CRC-32 list from a complete in-memory archive.
///
/// # Errors
///
/// Propagates any [`DexsumError`] from locating or parsing the directory.
pub fn multidex_crcs(archive: &[u8]) -> Result<Vec<u32>, DexsumError> {
    let window_start = archive.len().saturating_sub(EOCD_SEARCH_WINDOW);
    let eocd = EndOfCentralDirectory::find(&archive[window_start..])?;

    let start = eocd.cd_offset as usize;
    let end = start
        .checked_add(eocd.cd_size as usize)
        .ok_or(DexsumError::InvalidOffset)?;
    if end > archive.len() {
        return Err(DexsumError::InvalidOffset);
    }

    CentralDirectory::parse(&archive[start..end], eocd.entries)?.multidex_crcs()
}
