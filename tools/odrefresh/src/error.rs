//! Error taxonomy for checks and compilation units.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::metrics::Status;

/// Errors raised while checking or producing artifacts.
#[derive(Debug, Error)]
pub enum OdrError {
    /// A filesystem operation failed.
    #[error("{op} {}: {source}", path.display())]
    Io {
        /// What was being attempted, e.g. "failed to read".
        op: &'static str,
        /// The file or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The compiler exited unsuccessfully or could not be started.
    #[error("compiler failed: {0}")]
    Compiler(String),

    /// The compiler ran past its deadline.
    #[error("compiler timed out after {0:?}")]
    TimedOut(Duration),

    /// Not enough free space for a compilation unit.
    #[error("insufficient space in {}: {available} bytes free, {required} needed", path.display())]
    NoSpace {
        /// Directory that was checked.
        path: PathBuf,
        /// Bytes available.
        available: u64,
        /// Bytes required.
        required: u64,
    },

    /// No staging area could be set up.
    #[error("failed to prepare staging area: {0}")]
    StagingFailed(String),

    /// A state that should not be reachable.
    #[error("{0}")]
    Unknown(String),
}

impl OdrError {
    /// Build an [`OdrError::Io`] for `path`.
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Metrics status recorded for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Io { .. } => Status::IoError,
            Self::Compiler(_) => Status::CompilerError,
            Self::TimedOut(_) => Status::TimedOut,
            Self::NoSpace { .. } => Status::NoSpace,
            Self::StagingFailed(_) => Status::StagingFailed,
            Self::Unknown(_) => Status::Unknown,
        }
    }
}

/// Extension for attaching a path and an operation to `io::Result`.
pub trait IoContext<T> {
    /// Convert the error into [`OdrError::Io`].
    fn io_context(self, op: &'static str, path: &Path) -> Result<T, OdrError>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, op: &'static str, path: &Path) -> Result<T, OdrError> {
        self.map_err(|e| OdrError::io(op, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_error_maps_to_its_own_status() {
        let io = OdrError::io("failed to read", Path::new("/x"), io::ErrorKind::NotFound.into());
        assert_eq!(io.status(), Status::IoError);
        assert_eq!(OdrError::TimedOut(Duration::from_secs(1)).status(), Status::TimedOut);
        assert_eq!(OdrError::Compiler("exit 1".into()).status(), Status::CompilerError);
        assert_eq!(OdrError::StagingFailed("x".into()).status(), Status::StagingFailed);
    }

    #[test]
    fn io_errors_name_the_path() {
        let err = std::fs::read("/nonexistent/odrefresh/file")
            .io_context("failed to read", Path::new("/nonexistent/odrefresh/file"))
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to read /nonexistent/odrefresh/file"));
    }
}
