//! Command-line interface definitions for odrefresh.

use std::path::PathBuf;

use clap::{ArgAction, ArgGroup, Parser};

/// Refresh ahead-of-time compiled boot classpath and system server artifacts.
#[derive(Parser, Debug)]
#[command(name = "odrefresh", version, about)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["check", "compile", "force_compile"])
))]
pub struct Cli {
    /// Check whether artifacts are up to date and clean the cache; do not compile.
    #[arg(long)]
    pub check: bool,

    /// Check, then compile whatever is stale.
    #[arg(long)]
    pub compile: bool,

    /// Remove every cached artifact and compile all of them.
    #[arg(long)]
    pub force_compile: bool,

    /// Run every check and log compiler command lines without invoking the compiler.
    #[arg(long)]
    pub dry_run: bool,

    /// Only compile artifacts that are out of date or missing.
    #[arg(
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub partial_compilation: bool,

    /// Do not rewrite still-valid artifacts before reuse.
    #[arg(long)]
    pub no_refresh: bool,

    /// Skip the full boot image and build only the minimal fallback.
    #[arg(long)]
    pub minimal: bool,

    /// Use this staging directory instead of allocating one.
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Wall-clock budget for the whole run.
    #[arg(long, value_name = "SECS")]
    pub max_execution_seconds: Option<u64>,

    /// Ceiling for a single compiler invocation.
    #[arg(long, value_name = "SECS")]
    pub max_child_process_seconds: Option<u64>,

    /// Zygote layout: zygote32, zygote32_64, zygote64_32 or zygote64.
    #[arg(long, value_name = "KIND")]
    pub zygote_arch: Option<String>,

    /// Instruction set family given by its 64-bit member (arm64, x86_64, riscv64).
    #[arg(long, value_name = "ISA")]
    pub isa_pair: Option<String>,

    /// Writable artifact cache directory.
    #[arg(long = "dalvik-cache", value_name = "DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// Root of the read-only system partition.
    #[arg(long, value_name = "DIR", env = "ANDROID_ROOT")]
    pub android_root: Option<PathBuf>,

    /// Root of the runtime module.
    #[arg(long, value_name = "DIR", env = "ANDROID_ART_ROOT")]
    pub art_root: Option<PathBuf>,

    /// JSON list of installed modules.
    #[arg(long, value_name = "FILE")]
    pub apex_info_list: Option<PathBuf>,

    /// `key=value` file with the current system properties.
    #[arg(long, value_name = "FILE")]
    pub properties: Option<PathBuf>,

    /// Path to the ahead-of-time compiler.
    #[arg(long, value_name = "FILE")]
    pub dex2oat: Option<PathBuf>,

    /// Write the run's metrics record here.
    #[arg(long, value_name = "FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Compile inside the isolated VM with this context id.
    #[arg(long, value_name = "CID")]
    pub compilation_os_cid: Option<u32>,

    /// Launcher used to reach the isolated VM.
    #[arg(long, value_name = "FILE", requires = "compilation_os_cid")]
    pub launcher: Option<PathBuf>,

    /// Override userfaultfd detection.
    #[arg(long, value_name = "BOOL")]
    pub gc_feature_supported: Option<bool>,

    /// TOML file with default paths and budgets.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Full boot classpath, colon separated.
    #[arg(long, env = "BOOTCLASSPATH", hide_env_values = true)]
    pub boot_classpath: Option<String>,

    /// Compilable part of the boot classpath, colon separated.
    #[arg(long, env = "DEX2OATBOOTCLASSPATH", hide_env_values = true)]
    pub dex2oat_boot_classpath: Option<String>,

    /// System server classpath, colon separated.
    #[arg(long, env = "SYSTEMSERVERCLASSPATH", hide_env_values = true)]
    pub system_server_classpath: Option<String>,

    /// Standalone system server jars, colon separated.
    #[arg(long, env = "STANDALONE_SYSTEMSERVER_JARS", hide_env_values = true)]
    pub standalone_system_server_jars: Option<String>,

    /// Log only warnings and errors.
    #[arg(long, short = 'q', conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log debug output, including compiler command lines and timings.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// What the invocation was asked to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// `--check`
    Check,
    /// `--compile`
    Compile,
    /// `--force-compile`
    ForceCompile,
}

impl Cli {
    /// The selected action. Exactly one is guaranteed by the argument group.
    pub fn action(&self) -> Action {
        if self.force_compile {
            Action::ForceCompile
        } else if self.compile {
            Action::Compile
        } else {
            Action::Check
        }
    }
}
