//! Compiler backends.
//!
//! Both backends take the same argument records and report the same
//! [`ExecResult`]; they differ only in how the compiler process is reached.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dex2oat_cmd::{BootImageArgs, Dex2oatCommandBuilder, SystemServerArgs};
use crate::error::OdrError;

/// How often a running compiler is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on reaping a killed child.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a compiler invocation ended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// The process exited on its own.
    Exited,
    /// The process was killed by a signal it did not expect.
    Signaled,
    /// The deadline passed and the process was killed.
    TimedOut,
    /// The process could not be started.
    StartFailed,
    /// No process was run.
    #[default]
    NotRun,
}

/// Result of one compiler invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// How the process ended.
    pub status: ExecStatus,
    /// Exit code, for [`ExecStatus::Exited`].
    pub exit_code: i32,
    /// Signal number, for [`ExecStatus::Signaled`].
    pub signal: i32,
}

impl ExecResult {
    /// A clean exit with code 0.
    pub fn success() -> Self {
        Self::exited(0)
    }

    /// A normal exit with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            status: ExecStatus::Exited,
            exit_code: code,
            signal: 0,
        }
    }

    /// An invocation that hit its deadline.
    pub fn timed_out() -> Self {
        Self {
            status: ExecStatus::TimedOut,
            ..Self::default()
        }
    }

    /// Returns `true` for a clean exit with code 0.
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Exited && self.exit_code == 0
    }

    /// Convert into the error taxonomy. `timeout` is reported for deadline hits.
    pub fn check(self, timeout: Duration) -> Result<(), OdrError> {
        match self.status {
            ExecStatus::Exited if self.exit_code == 0 => Ok(()),
            ExecStatus::Exited => Err(OdrError::Compiler(format!("exited with code {}", self.exit_code))),
            ExecStatus::Signaled => Err(OdrError::Compiler(format!("killed by signal {}", self.signal))),
            ExecStatus::TimedOut => Err(OdrError::TimedOut(timeout)),
            ExecStatus::StartFailed => Err(OdrError::Compiler("failed to start".into())),
            ExecStatus::NotRun => Err(OdrError::Unknown("compiler was not run".into())),
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::exited(code),
            None => Self {
                status: ExecStatus::Signaled,
                exit_code: -1,
                signal: status.signal().unwrap_or(0),
            },
        }
    }
}

/// Executes compiler invocations.
pub trait CompilerBackend {
    /// Compile a boot image (primary, minimal or extension).
    fn compile_boot_image(&self, args: &BootImageArgs, timeout: Duration) -> ExecResult;

    /// Compile one system server jar.
    fn compile_system_server_jar(&self, args: &SystemServerArgs, timeout: Duration) -> ExecResult;
}

/// Runs the compiler as a local child process.
pub struct LocalCompiler {
    dex2oat: PathBuf,
}

impl LocalCompiler {
    /// Backend invoking the compiler at `dex2oat`.
    pub fn new(dex2oat: impl Into<PathBuf>) -> Self {
        Self {
            dex2oat: dex2oat.into(),
        }
    }
}

impl CompilerBackend for LocalCompiler {
    fn compile_boot_image(&self, args: &BootImageArgs, timeout: Duration) -> ExecResult {
        execute(&args.command(&self.dex2oat), timeout)
    }

    fn compile_system_server_jar(&self, args: &SystemServerArgs, timeout: Duration) -> ExecResult {
        execute(&args.command(&self.dex2oat), timeout)
    }
}

/// Runs the compiler inside an isolated VM through a launcher.
///
/// Files are not shared with the VM implicitly: every input is forwarded
/// read-only and every output read-write.
pub struct RemoteCompiler {
    launcher: PathBuf,
    cid: u32,
    dex2oat: PathBuf,
}

impl RemoteCompiler {
    /// Backend reaching VM `cid` through `launcher`.
    pub fn new(launcher: impl Into<PathBuf>, cid: u32, dex2oat: impl Into<PathBuf>) -> Self {
        Self {
            launcher: launcher.into(),
            cid,
            dex2oat: dex2oat.into(),
        }
    }

    /// Wrap a compiler command into a launcher command forwarding `inputs` and `outputs`.
    pub fn wrap(
        &self,
        inner: &Dex2oatCommandBuilder,
        inputs: &[PathBuf],
        outputs: &[&Path],
    ) -> Dex2oatCommandBuilder {
        let mut cmd = Dex2oatCommandBuilder::new(&self.launcher);
        cmd.arg(format!("--cid={}", self.cid));
        for path in inputs {
            cmd.arg(format!("--ro-file={}", path.display()));
        }
        for path in outputs {
            cmd.arg(format!("--rw-file={}", path.display()));
        }
        cmd.arg("--").arg(inner.program().display().to_string());
        for arg in inner.args() {
            cmd.arg(arg.clone());
        }
        cmd
    }
}

impl CompilerBackend for RemoteCompiler {
    fn compile_boot_image(&self, args: &BootImageArgs, timeout: Duration) -> ExecResult {
        let cmd = self.wrap(&args.command(&self.dex2oat), &args.inputs(), &args.outputs.paths());
        execute(&cmd, timeout)
    }

    fn compile_system_server_jar(&self, args: &SystemServerArgs, timeout: Duration) -> ExecResult {
        let cmd = self.wrap(&args.command(&self.dex2oat), &args.inputs(), &args.outputs.paths());
        execute(&cmd, timeout)
    }
}

/// Spawn `cmd` and wait for it, killing it once `timeout` has passed.
pub fn execute(cmd: &Dex2oatCommandBuilder, timeout: Duration) -> ExecResult {
    let mut child = match Command::new(cmd.program())
        .args(cmd.args())
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to start {}: {e}", cmd.program().display());
            return ExecResult {
                status: ExecStatus::StartFailed,
                ..ExecResult::default()
            };
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return ExecResult::from_status(status),
            Ok(None) => {}
            Err(e) => {
                warn!("failed to poll {}: {e}", cmd.program().display());
                kill_and_reap(&mut child);
                return ExecResult {
                    status: ExecStatus::Signaled,
                    exit_code: -1,
                    ..ExecResult::default()
                };
            }
        }
        if Instant::now() >= deadline {
            warn!("{} timed out after {timeout:?}", cmd.program().display());
            kill_and_reap(&mut child);
            return ExecResult::timed_out();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill a child and wait a bounded time for it to be reaped.
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let reap_deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => {}
        }
        if Instant::now() >= reap_deadline {
            debug!("child {} not reaped after kill", child.id());
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
