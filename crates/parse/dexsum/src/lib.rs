//! Embedded dex checksum extraction.
//!
//! Reads the checksums that dex containers already carry instead of hashing
//! whole files: the adler32 field of a raw dex header, or the CRC-32 recorded
//! in a zip central directory for each `classes*.dex` entry. Everything works
//! on byte slices; callers decide how much of the file to read.
//!
//! # Usage
//!
//! ```
//! use odrefresh_dexsum::{Container, DexsumError};
//!
//! fn checksums(data: &[u8]) -> Result<Vec<u32>, DexsumError> {
//!     match Container::sniff(data)? {
//!         Container::Dex => Ok(vec![odrefresh_dexsum::DexHeader::parse(data)?.checksum]),
//!         Container::Zip => odrefresh_dexsum::multidex_crcs(data),
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod dex;
pub mod zip;

use core::fmt;

pub use dex::{DEX_HEADER_PREFIX_SIZE, DexHeader};
pub use zip::{
    CentralDirectory, CentralEntry, EOCD_SEARCH_WINDOW, EndOfCentralDirectory, multidex_crcs,
    multidex_entry_name,
};

/// Read a little-endian `u16` from `data` at byte offset `off`.
///
/// # Panics
///
/// Panics if `off + 2 > data.len()`. Callers must bounds-check first.
pub(crate) fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

/// Read a little-endian `u32` from `data` at byte offset `off`.
pub(crate) fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Errors that can occur while extracting checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexsumError {
    /// The data is neither a dex file nor a zip archive.
    BadMagic,
    /// The input data is too short for the declared structure.
    Truncated,
    /// A directory offset or size is out of bounds.
    InvalidOffset,
    /// The archive holds no `classes.dex` entry.
    NoDexEntries,
}

impl fmt::Display for DexsumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a dex file or zip archive"),
            Self::Truncated => write!(f, "input data truncated"),
            Self::InvalidOffset => write!(f, "invalid central directory offset or size"),
            Self::NoDexEntries => write!(f, "archive contains no classes.dex entry"),
        }
    }
}

impl core::error::Error for DexsumError {}

/// Container format detected from the leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// A raw dex file (`dex\n`).
    Dex,
    /// A zip archive (`PK\x03\x04`), e.g. a jar or apk.
    Zip,
}

impl Container {
    /// Identify the container from the first four bytes of a file.
    ///
    /// # Errors
    ///
    /// Returns [`DexsumError::Truncated`] for fewer than four bytes and
    /// [`DexsumError::BadMagic`] for anything unrecognised.
    pub fn sniff(data: &[u8]) -> Result<Self, DexsumError> {
        let magic: &[u8; 4] = data.first_chunk().ok_or(DexsumError::Truncated)?;
        if *magic == dex::DEX_MAGIC {
            Ok(Self::Dex)
        } else if le_u32(magic, 0) == zip::LOCAL_HEADER_SIG {
            Ok(Self::Zip)
        } else {
            Err(DexsumError::BadMagic)
        }
    }
}
