//! Pruning and refreshing the artifact cache.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{IoContext, OdrError};
use crate::fsutil;

/// Mode of installed artifacts.
const ARTIFACT_MODE: u32 = 0o644;

/// Delete every file under `dir` that is not in `keep`.
///
/// Directories are left in place. If anything cannot be removed the whole
/// directory is wiped, so that a stale file can never outlive a failed
/// cleanup, and the error is returned.
pub fn cleanup_artifact_directory(dir: &Path, keep: &[PathBuf]) -> Result<(), OdrError> {
    let keep: BTreeSet<&Path> = keep.iter().map(PathBuf::as_path).collect();
    match prune(dir, &keep) {
        Ok(removed) => {
            if removed > 0 {
                info!("removed {removed} stale files from {}", dir.display());
            }
            Ok(())
        }
        Err(e) => {
            warn!("cleanup failed ({e}), removing {}", dir.display());
            fsutil::remove_dir(dir)?;
            Err(e)
        }
    }
}

fn prune(dir: &Path, keep: &BTreeSet<&Path>) -> Result<usize, OdrError> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            OdrError::io("failed to walk", &path, e.into())
        })?;
        if entry.file_type().is_dir() || keep.contains(entry.path()) {
            continue;
        }
        debug!("removing {}", entry.path().display());
        fs::remove_file(entry.path()).io_context("failed to remove", entry.path())?;
        removed += 1;
    }
    Ok(removed)
}

/// Rewrite every file under `dir` in place.
///
/// A fresh copy drops any integrity attributes the old inode carried, which
/// would otherwise make the file immutable to the next compilation.
pub fn refresh_existing_artifacts(dir: &Path) -> Result<(), OdrError> {
    if !dir.exists() {
        return Ok(());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            OdrError::io("failed to walk", &path, e.into())
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    for path in &files {
        let data = fs::read(path).io_context("failed to read", path)?;
        fs::remove_file(path).io_context("failed to remove", path)?;
        fs::write(path, &data).io_context("failed to write", path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(ARTIFACT_MODE))
            .io_context("failed to set permissions on", path)?;
    }
    debug!("refreshed {} files in {}", files.len(), dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn keeps_listed_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("arm64/boot.oat");
        let stale = dir.path().join("arm64/old.odex");
        let stray = dir.path().join("notes.txt");
        for path in [&kept, &stale, &stray] {
            touch(path, b"x");
        }

        cleanup_artifact_directory(dir.path(), &[kept.clone()]).unwrap();

        assert!(kept.exists());
        assert!(!stale.exists());
        assert!(!stray.exists());
        assert!(dir.path().join("arm64").is_dir());
    }

    #[test]
    fn missing_directory_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cleanup_artifact_directory(&dir.path().join("none"), &[]).is_ok());
    }

    #[test]
    fn refresh_preserves_content_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arm64/boot.art");
        touch(&path, b"image bytes");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        refresh_existing_artifacts(dir.path()).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"image bytes");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, ARTIFACT_MODE);
    }
}
