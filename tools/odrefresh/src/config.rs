//! Immutable run configuration.
//!
//! Built once from the command line, the environment, an optional TOML file
//! and the property snapshot, then passed by reference to the checker and the
//! orchestrator. Nothing here changes after construction.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cli::Cli;
use crate::isa::{Isa, IsaPair, ZygoteKind};
use crate::props::{self, PropertySnapshot};

/// Name of the runtime's own module.
pub const ART_MODULE_NAME: &str = "com.android.art";

/// Default wall-clock budget for a run.
pub const DEFAULT_MAX_EXECUTION_SECONDS: u64 = 480;

/// Default ceiling for one compiler invocation.
pub const DEFAULT_MAX_CHILD_PROCESS_SECONDS: u64 = 90;

const DEFAULT_ANDROID_ROOT: &str = "/system";
const DEFAULT_ART_ROOT: &str = "/apex/com.android.art";
const DEFAULT_ARTIFACT_DIR: &str = "/data/misc/apexdata/com.android.art/dalvik-cache";
const DEFAULT_APEX_INFO_LIST: &str = "/apex/apex-info-list.json";
const DEFAULT_DEX2OAT: &str = "/apex/com.android.art/bin/dex2oat64";
const DEFAULT_LAUNCHER: &str = "/apex/com.android.compos/bin/composd_cmd";

/// Manifest filename within the artifact directory.
pub const MANIFEST_FILE: &str = "cache-info.json";

/// Optional defaults read from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
#[allow(missing_docs)] // mirrors the CLI flags of the same name
pub struct FileConfig {
    pub android_root: Option<PathBuf>,
    pub art_root: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    pub apex_info_list: Option<PathBuf>,
    pub dex2oat: Option<PathBuf>,
    pub properties: Option<PathBuf>,
    pub metrics_file: Option<PathBuf>,
    pub zygote_arch: Option<String>,
    pub isa_pair: Option<String>,
    pub max_execution_seconds: Option<u64>,
    pub max_child_process_seconds: Option<u64>,
}

impl FileConfig {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// How compiler invocations are executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Spawn the compiler as a local child process.
    Local,
    /// Run it in an isolated VM through a launcher.
    Remote {
        /// Launcher executable.
        launcher: PathBuf,
        /// VM context id.
        cid: u32,
    },
}

/// Everything a run needs to know, fixed at startup.
#[derive(Clone, Debug)]
pub struct OdrConfig {
    /// Runtime module root; jars below it are runtime jars.
    pub art_root: PathBuf,
    /// System partition root.
    pub android_root: PathBuf,
    /// Writable artifact cache.
    pub artifact_dir: PathBuf,
    /// Compiler executable.
    pub dex2oat: PathBuf,
    /// Installed module list.
    pub apex_info_list: PathBuf,
    /// Operator-provided staging directory.
    pub staging_dir: Option<PathBuf>,
    /// Where to write the metrics record, if anywhere.
    pub metrics_file: Option<PathBuf>,
    /// `BOOTCLASSPATH`.
    pub boot_classpath: Vec<String>,
    /// `DEX2OATBOOTCLASSPATH`.
    pub dex2oat_boot_classpath: Vec<String>,
    /// `SYSTEMSERVERCLASSPATH`.
    pub system_server_classpath: Vec<String>,
    /// `STANDALONE_SYSTEMSERVER_JARS`.
    pub standalone_system_server_jars: Vec<String>,
    /// Boot classpath instruction sets, primary first.
    pub boot_classpath_isas: Vec<Isa>,
    /// Instruction set of system server.
    pub system_server_isa: Isa,
    /// Skip compiler invocations.
    pub dry_run: bool,
    /// Compile only what is stale.
    pub partial_compilation: bool,
    /// Rewrite kept artifacts before compiling.
    pub refresh: bool,
    /// Force the minimal boot image path.
    pub minimal: bool,
    /// Local or remote compilation.
    pub backend: BackendKind,
    /// Wall-clock budget for the whole run.
    pub max_execution: Duration,
    /// Ceiling for a single compiler invocation.
    pub max_child_process: Duration,
    /// Tracked properties.
    pub system_properties: PropertySnapshot,
    /// Value of the build-time userfaultfd GC flag.
    pub build_uffd_gc: bool,
    /// Whether the kernel supports the userfaultfd GC.
    pub gc_feature_supported: bool,
    /// Explicit boot image filter; empty means profile-guided.
    pub boot_image_compiler_filter: String,
    /// Filter for system server jars.
    pub system_server_compiler_filter: String,
    /// `-j` for every compiler invocation, if set.
    pub dex2oat_threads: Option<u32>,
    /// Raw CPU set spec for every compiler invocation; empty when unset.
    pub dex2oat_cpu_set: String,
}

/// Split a colon-separated classpath, dropping empty elements.
pub fn split_classpath(cp: &str) -> Vec<String> {
    cp.split(':').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

impl OdrConfig {
    /// Build the configuration from parsed arguments.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let Some(boot_classpath) = cli.boot_classpath.as_deref() else {
            bail!("BOOTCLASSPATH is not set");
        };
        let Some(dex2oat_boot_classpath) = cli.dex2oat_boot_classpath.as_deref() else {
            bail!("DEX2OATBOOTCLASSPATH is not set");
        };
        let Some(system_server_classpath) = cli.system_server_classpath.as_deref() else {
            bail!("SYSTEMSERVERCLASSPATH is not set");
        };

        let zygote: ZygoteKind = cli
            .zygote_arch
            .as_deref()
            .or(file.zygote_arch.as_deref())
            .unwrap_or("zygote64_32")
            .parse()?;
        let pair = match cli.isa_pair.as_deref().or(file.isa_pair.as_deref()) {
            Some(s) => s.parse::<IsaPair>()?,
            None => IsaPair::host(),
        };

        let all_props = match cli.properties.as_ref().or(file.properties.as_ref()) {
            Some(path) => props::read_properties(path)?,
            None => BTreeMap::new(),
        };

        let backend = match cli.compilation_os_cid {
            Some(cid) => BackendKind::Remote {
                launcher: cli.launcher.clone().unwrap_or_else(|| DEFAULT_LAUNCHER.into()),
                cid,
            },
            None => BackendKind::Local,
        };

        let pick = |cli_val: &Option<PathBuf>, file_val: Option<PathBuf>, default: &str| {
            cli_val.clone().or(file_val).unwrap_or_else(|| PathBuf::from(default))
        };

        Ok(Self {
            art_root: pick(&cli.art_root, file.art_root, DEFAULT_ART_ROOT),
            android_root: pick(&cli.android_root, file.android_root, DEFAULT_ANDROID_ROOT),
            artifact_dir: pick(&cli.artifact_dir, file.artifact_dir, DEFAULT_ARTIFACT_DIR),
            dex2oat: pick(&cli.dex2oat, file.dex2oat, DEFAULT_DEX2OAT),
            apex_info_list: pick(&cli.apex_info_list, file.apex_info_list, DEFAULT_APEX_INFO_LIST),
            staging_dir: cli.staging_dir.clone(),
            metrics_file: cli.metrics_file.clone().or(file.metrics_file),
            boot_classpath: split_classpath(boot_classpath),
            dex2oat_boot_classpath: split_classpath(dex2oat_boot_classpath),
            system_server_classpath: split_classpath(system_server_classpath),
            standalone_system_server_jars: cli
                .standalone_system_server_jars
                .as_deref()
                .map(split_classpath)
                .unwrap_or_default(),
            boot_classpath_isas: zygote.boot_classpath_isas(pair)?,
            system_server_isa: zygote.system_server_isa(pair)?,
            dry_run: cli.dry_run,
            partial_compilation: cli.partial_compilation,
            refresh: !cli.no_refresh,
            minimal: cli.minimal,
            backend,
            max_execution: Duration::from_secs(
                cli.max_execution_seconds
                    .or(file.max_execution_seconds)
                    .unwrap_or(DEFAULT_MAX_EXECUTION_SECONDS),
            ),
            max_child_process: Duration::from_secs(
                cli.max_child_process_seconds
                    .or(file.max_child_process_seconds)
                    .unwrap_or(DEFAULT_MAX_CHILD_PROCESS_SECONDS),
            ),
            build_uffd_gc: props::get_bool(&all_props, props::BUILD_UFFD_GC, false),
            gc_feature_supported: cli.gc_feature_supported.unwrap_or_else(kernel_supports_uffd),
            boot_image_compiler_filter: all_props
                .get(props::BOOT_IMAGE_FILTER)
                .cloned()
                .unwrap_or_default(),
            system_server_compiler_filter: system_server_filter(&all_props),
            dex2oat_threads: props::get_positive(&all_props, props::BOOT_DEX2OAT_THREADS),
            dex2oat_cpu_set: all_props
                .get(props::BOOT_DEX2OAT_CPU_SET)
                .cloned()
                .unwrap_or_default(),
            system_properties: props::snapshot(&all_props),
        })
    }

    /// Path of the cache manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.artifact_dir.join(MANIFEST_FILE)
    }

    /// Map a device path onto the real file, following the system partition root.
    pub fn resolve(&self, jar: &str) -> PathBuf {
        match jar.strip_prefix("/system/") {
            Some(rest) if self.android_root != Path::new(DEFAULT_ANDROID_ROOT) => {
                self.android_root.join(rest)
            }
            _ => PathBuf::from(jar),
        }
    }

    /// Returns `true` if `jar` is shipped by the runtime module.
    pub fn is_runtime_jar(&self, jar: &str) -> bool {
        Path::new(jar).starts_with(&self.art_root)
    }

    /// Boot classpath jars belonging to the runtime module.
    pub fn art_boot_classpath(&self) -> Vec<String> {
        self.dex2oat_boot_classpath
            .iter()
            .filter(|jar| self.is_runtime_jar(jar))
            .cloned()
            .collect()
    }

    /// Updatable tail of the boot classpath, not part of the primary image.
    pub fn mainline_boot_classpath(&self) -> Vec<String> {
        self.boot_classpath
            .iter()
            .filter(|jar| !self.dex2oat_boot_classpath.contains(jar))
            .cloned()
            .collect()
    }

    /// Every system server jar: classpath first, then standalone jars.
    pub fn all_system_server_jars(&self) -> Vec<String> {
        self.system_server_classpath
            .iter()
            .chain(&self.standalone_system_server_jars)
            .cloned()
            .collect()
    }

    /// Returns `true` if `jar` is on the linear system server classpath.
    pub fn in_system_server_classpath(&self, jar: &str) -> bool {
        self.system_server_classpath.iter().any(|j| j == jar)
    }
}

/// The override flag wins over the regular property; `speed` otherwise.
fn system_server_filter(all: &BTreeMap<String, String>) -> String {
    const OVERRIDE: &str =
        "persist.device_config.runtime_native_boot.systemservercompilerfilter_override";
    [OVERRIDE, props::SYSTEM_SERVER_FILTER]
        .iter()
        .filter_map(|k| all.get(*k))
        .find(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| "speed".to_string())
}

/// Detect userfaultfd support in the running kernel.
fn kernel_supports_uffd() -> bool {
    Path::new("/dev/userfaultfd").exists()
        || Path::new("/proc/sys/vm/unprivileged_userfaultfd").exists()
}
