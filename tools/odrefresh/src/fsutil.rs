//! Filesystem helpers shared by the checker, cleanup and the orchestrator.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{IoContext, OdrError};

/// Approximate space one boot image triple needs, measured on device builds.
pub const MIN_SPACE_FOR_COMPILATION: u64 = 48 * 1024 * 1024;

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn free_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

/// Fail with [`OdrError::NoSpace`] unless `dir` has room for another unit.
pub fn check_compilation_space(dir: &Path) -> Result<(), OdrError> {
    let available = free_space(dir).io_context("failed to query free space of", dir)?;
    if available < MIN_SPACE_FOR_COMPILATION {
        return Err(OdrError::NoSpace {
            path: dir.to_path_buf(),
            available,
            required: MIN_SPACE_FOR_COMPILATION,
        });
    }
    Ok(())
}

/// Create `dir` and its parents if needed.
pub fn ensure_dir(dir: &Path) -> Result<(), OdrError> {
    fs::create_dir_all(dir).io_context("failed to create", dir)
}

/// Remove `dir` recursively. A missing directory is not an error.
pub fn remove_dir(dir: &Path) -> Result<(), OdrError> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(OdrError::io("failed to remove", dir, e)),
        _ => Ok(()),
    }
}

/// Remove a file. A missing file is not an error.
pub fn remove_file(path: &Path) -> Result<(), OdrError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(OdrError::io("failed to remove", path, e)),
        _ => Ok(()),
    }
}
