//! On-device refresh of ahead-of-time compiled runtime artifacts.
//!
//! Decides whether the compiled boot classpath images and system server
//! artifacts still match the installed modules and input jars, recompiles the
//! stale subset, and installs the results without ever leaving a partial
//! artifact behind.
//!
//! Pipeline: read modules → evaluate trust → check artifacts → clean cache →
//!           write manifest → compile per instruction set → system server.

pub mod artifacts;
pub mod backend;
pub mod cache;
pub mod check;
pub mod cleanup;
pub mod cli;
pub mod component;
pub mod config;
pub mod context;
pub mod dex2oat_cmd;
pub mod error;
pub mod fsutil;
pub mod isa;
pub mod metrics;
pub mod modules;
pub mod orchestrator;
pub mod precondition;
pub mod props;
pub mod staging;
pub mod verbose;

use tracing::{error, info, warn};

use crate::backend::CompilerBackend;
use crate::check::CompilationOptions;
use crate::cli::Action;
use crate::config::OdrConfig;
use crate::metrics::{OdrMetrics, Status};
use crate::modules::ModuleInfoSource;
use crate::orchestrator::{Deadline, Orchestrator};

/// Process exit codes understood by the caller that schedules refreshes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Nothing to do.
    Okay = 0,
    /// Artifacts are stale; run again with `--compile`.
    CompilationRequired = 79,
    /// Everything scheduled was compiled.
    CompilationSuccess = 80,
    /// At least one unit failed.
    CompilationFailed = 81,
    /// The cache could not be cleaned or prepared.
    CleanupFailed = 82,
}

impl ExitCode {
    /// Numeric process exit code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        Self::from(code.code())
    }
}

/// Run one action to completion and write the metrics record if configured.
pub fn run(
    action: Action,
    config: &OdrConfig,
    backend: &dyn CompilerBackend,
    modules: &dyn ModuleInfoSource,
    deadline: Deadline,
    metrics: &mut OdrMetrics,
) -> ExitCode {
    metrics.capture_space_free_start(&config.artifact_dir);

    let modules = modules.modules().unwrap_or_else(|e| {
        warn!("failed to read module metadata: {e:#}");
        Vec::new()
    });
    let orchestrator = Orchestrator::new(config, backend, deadline);

    let code = match action {
        Action::Check => check::check_artifacts_are_up_to_date(config, &modules, metrics).exit_code,
        Action::Compile => {
            let result = check::check_artifacts_are_up_to_date(config, &modules, metrics);
            if result.exit_code == ExitCode::CompilationRequired {
                let options = if config.partial_compilation {
                    Ok(result.options)
                } else {
                    wipe_cache(config, metrics).map(|()| CompilationOptions::all(config))
                };
                match options {
                    Ok(options) => orchestrator.compile(&options, &modules, metrics),
                    Err(code) => code,
                }
            } else {
                result.exit_code
            }
        }
        Action::ForceCompile => match wipe_cache(config, metrics) {
            Ok(()) => orchestrator.compile(&CompilationOptions::all(config), &modules, metrics),
            Err(code) => code,
        },
    };

    metrics.capture_space_free_end(&config.artifact_dir);
    if let Some(path) = &config.metrics_file {
        if let Err(e) = metrics.write(path) {
            warn!("failed to write metrics: {e}");
        }
    }
    info!("exiting with {code:?} ({})", code.code());
    code
}

/// Remove every cached artifact.
fn wipe_cache(config: &OdrConfig, metrics: &mut OdrMetrics) -> Result<(), ExitCode> {
    fsutil::remove_dir(&config.artifact_dir).map_err(|e| {
        error!("{e}");
        metrics.set_status(Status::IoError);
        ExitCode::CleanupFailed
    })
}
