//! Staging area and the commit-or-erase protocol for compiler outputs.
//!
//! Outputs are written to files in a private staging directory. Only after the
//! compiler succeeds are they moved into place, all together; if any move
//! fails, everything from the unit is removed again so that no partial triple
//! is ever installed.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::artifacts::{ArtifactTriple, staging_location};
use crate::error::{IoContext, OdrError};
use crate::fsutil;

/// Name of the staging directory allocated next to the artifact directory.
const STAGING_DIR_NAME: &str = "odrefresh-staging";

/// A directory owned by the current run for in-progress outputs.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Use `requested` if given, otherwise allocate a fresh directory beside `artifact_dir`.
    ///
    /// A freshly allocated directory is emptied first; leftovers from a crashed
    /// run are never reused.
    pub fn prepare(requested: Option<&Path>, artifact_dir: &Path) -> Result<Self, OdrError> {
        let staging_failed = |e: OdrError| OdrError::StagingFailed(e.to_string());
        let dir = match requested {
            Some(dir) => dir.to_path_buf(),
            None => {
                let parent = artifact_dir.parent().unwrap_or(artifact_dir);
                let dir = parent.join(STAGING_DIR_NAME);
                fsutil::remove_dir(&dir).map_err(staging_failed)?;
                dir
            }
        };
        fsutil::ensure_dir(&dir).map_err(staging_failed)?;
        Ok(Self { dir })
    }

    /// The staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete the staging directory and everything in it.
    pub fn remove(self) -> Result<(), OdrError> {
        fsutil::remove_dir(&self.dir)
    }
}

/// Staged output files for one compilation unit.
///
/// Dropping without [`StagedFiles::commit`] erases the staged files.
#[derive(Debug)]
pub struct StagedFiles {
    /// `(staged, install)` pairs.
    files: Vec<(PathBuf, PathBuf)>,
    committed: bool,
}

impl StagedFiles {
    /// Create empty, owner-only staged files for every member of `install`.
    ///
    /// Returns the guard and the staged triple to hand to the compiler.
    pub fn create(staging_dir: &Path, install: &ArtifactTriple) -> Result<(Self, ArtifactTriple), OdrError> {
        let staged = ArtifactTriple {
            image: staging_location(staging_dir, &install.image),
            oat: staging_location(staging_dir, &install.oat),
            vdex: staging_location(staging_dir, &install.vdex),
        };
        let mut guard = Self {
            files: Vec::with_capacity(3),
            committed: false,
        };
        for (staged_path, install_path) in staged.paths().into_iter().zip(install.paths()) {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(staged_path)
                .io_context("failed to create staging file", staged_path)?;
            guard.files.push((staged_path.to_path_buf(), install_path.to_path_buf()));
        }
        Ok((guard, staged))
    }

    /// Move every staged file to its install path.
    ///
    /// On the first failure, every staged file and every file already moved
    /// by this call is deleted and the error is returned.
    pub fn commit(mut self) -> Result<(), OdrError> {
        let mut moved: Vec<PathBuf> = Vec::with_capacity(self.files.len());
        for (staged, install) in &self.files {
            if let Err(e) = move_file(staged, install) {
                for path in &moved {
                    if let Err(rm) = fsutil::remove_file(path) {
                        warn!("{rm}");
                    }
                }
                self.erase();
                self.committed = true;
                return Err(e);
            }
            debug!("installed {}", install.display());
            moved.push(install.clone());
        }
        self.committed = true;
        Ok(())
    }

    fn erase(&self) {
        for (staged, _) in &self.files {
            if let Err(e) = fsutil::remove_file(staged) {
                warn!("{e}");
            }
        }
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        if !self.committed {
            self.erase();
        }
    }
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<(), OdrError> {
    if let Some(dir) = to.parent() {
        fsutil::ensure_dir(dir)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).io_context("failed to install", to)?;
    fs::remove_file(from).io_context("failed to remove", from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_triple(dir: &Path) -> ArtifactTriple {
        ArtifactTriple::for_boot_image(&dir.join("install/arm64/boot.art"))
    }

    #[test]
    fn commit_moves_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::prepare(Some(&dir.path().join("staging")), dir.path()).unwrap();
        let install = install_triple(dir.path());

        let (guard, staged) = StagedFiles::create(area.dir(), &install).unwrap();
        fs::write(&staged.oat, b"oat").unwrap();
        guard.commit().unwrap();

        for path in install.paths() {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert_eq!(fs::read(&install.oat).unwrap(), b"oat");
        assert!(!staged.oat.exists());
    }

    #[test]
    fn dropping_without_commit_erases_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let install = install_triple(dir.path());
        let staged = {
            let (_guard, staged) = StagedFiles::create(dir.path(), &install).unwrap();
            assert!(staged.image.exists());
            staged
        };
        for path in staged.paths() {
            assert!(!path.exists());
        }
        assert!(!install.image.exists());
    }

    #[test]
    fn failed_move_removes_everything_from_the_unit() {
        let dir = tempfile::tempdir().unwrap();
        let install = install_triple(dir.path());
        let (guard, staged) = StagedFiles::create(dir.path(), &install).unwrap();
        // A directory where the vdex should go makes the last move fail.
        fs::create_dir_all(&install.vdex).unwrap();
        fs::write(install.vdex.join("occupied"), b"x").unwrap();

        assert!(guard.commit().is_err());
        assert!(!install.image.exists());
        assert!(!install.oat.exists());
        for path in staged.paths() {
            assert!(!path.exists());
        }
    }

    #[test]
    fn allocated_staging_dir_is_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("dalvik-cache");
        let leftover = dir.path().join(STAGING_DIR_NAME).join("stale.oat");
        fs::create_dir_all(leftover.parent().unwrap()).unwrap();
        fs::write(&leftover, b"x").unwrap();

        let area = StagingArea::prepare(None, &artifact_dir).unwrap();
        assert_eq!(area.dir(), dir.path().join(STAGING_DIR_NAME));
        assert!(!leftover.exists());
        area.remove().unwrap();
        assert!(!dir.path().join(STAGING_DIR_NAME).exists());
    }
}
