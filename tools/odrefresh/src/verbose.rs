//! Log output setup and timing.
//!
//! Three levels controlled by CLI flags:
//! - **Quiet** (`-q`): warnings and errors only
//! - **Default** (no flag): one line per decision and compilation unit
//! - **Verbose** (`-v`): verdicts, commands, per-file cleanup and timings
//!
//! `RUST_LOG` overrides the flags.

use std::time::Instant;

use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Output verbosity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Warnings and errors.
    Quiet,
    /// Informational messages.
    Default,
    /// Everything.
    Verbose,
}

impl Verbosity {
    /// Level selected by the `-q`/`-v` flags.
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        if quiet {
            Self::Quiet
        } else if verbose {
            Self::Verbose
        } else {
            Self::Default
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Default => "info",
            Self::Verbose => "debug",
        }
    }
}

/// Install the global subscriber. Logs go to stderr.
pub fn init(verbosity: Verbosity) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}

/// RAII timer that logs the elapsed duration at debug level on drop.
///
/// ```ignore
/// let _t = Timer::start("arm64 primary boot image");
/// // ... work ...
/// // logs "arm64 primary boot image: 42.0s" on drop
/// ```
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    /// Begin timing a labeled operation.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!("{}: {:.1?}", self.label, self.start.elapsed());
    }
}
