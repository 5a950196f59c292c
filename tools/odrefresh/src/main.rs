//! `odrefresh` command-line entry point.
//!
//! Exit status is one of the codes in [`odrefresh::ExitCode`]; usage errors
//! exit through clap, configuration errors with [`ExitCode::CleanupFailed`].

use std::process;

use anyhow::Result;
use clap::Parser;
use odrefresh::backend::{CompilerBackend, LocalCompiler, RemoteCompiler};
use odrefresh::cli::Cli;
use odrefresh::config::{BackendKind, OdrConfig};
use odrefresh::metrics::OdrMetrics;
use odrefresh::modules::ApexInfoListFile;
use odrefresh::orchestrator::Deadline;
use odrefresh::verbose::{self, Verbosity};
use odrefresh::ExitCode;
use tracing::{error, info};

fn main() -> process::ExitCode {
    let cli = Cli::parse();
    verbose::init(Verbosity::from_flags(cli.quiet, cli.verbose));

    match cmd_refresh(&cli) {
        Ok(code) => code.into(),
        Err(e) => {
            error!("{e:#}");
            ExitCode::CleanupFailed.into()
        }
    }
}

fn cmd_refresh(cli: &Cli) -> Result<ExitCode> {
    let config = OdrConfig::from_cli(cli)?;
    let deadline = Deadline::new(config.max_execution, config.max_child_process);

    let backend: Box<dyn CompilerBackend> = match &config.backend {
        BackendKind::Local => Box::new(LocalCompiler::new(&config.dex2oat)),
        BackendKind::Remote { launcher, cid } => {
            info!("compiling in VM {cid} through {}", launcher.display());
            Box::new(RemoteCompiler::new(launcher, *cid, &config.dex2oat))
        }
    };
    let modules = ApexInfoListFile::new(&config.apex_info_list);
    let mut metrics = OdrMetrics::default();

    Ok(odrefresh::run(
        cli.action(),
        &config,
        backend.as_ref(),
        &modules,
        deadline,
        &mut metrics,
    ))
}
