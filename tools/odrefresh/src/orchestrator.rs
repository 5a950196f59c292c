//! Compilation of scheduled artifacts.
//!
//! Units run one at a time: boot images per instruction set (primary, then
//! the mainline extension), then system server jars in load order. A failed
//! unit does not stop independent ones; only the first failure is reported.
//!
//! Every unit writes into the staging area and is installed with
//! [`StagedFiles::commit`], so a failed or interrupted unit never replaces
//! what is already installed.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::ExitCode;
use crate::artifacts::{ArtifactTriple, Layout};
use crate::backend::{CompilerBackend, ExecResult};
use crate::cache::CacheManifest;
use crate::check::{BootImages, CompilationOptions};
use crate::cleanup;
use crate::component::is_file;
use crate::config::OdrConfig;
use crate::context::{self, JarContext};
use crate::dex2oat_cmd::{BootImageArgs, BootImageComponent, Concurrency, SystemServerArgs};
use crate::error::OdrError;
use crate::fsutil;
use crate::isa::Isa;
use crate::metrics::{BcpCompilationType, OdrMetrics, Stage, Status};
use crate::modules::ModuleInfo;
use crate::staging::{StagedFiles, StagingArea};
use crate::verbose::Timer;

/// Filter for the mainline extension; its jars ship without profiles.
const MAINLINE_EXTENSION_FILTER: &str = "verify";

/// Wall-clock budget of a run, started when the process starts.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
    max_child: Duration,
}

impl Deadline {
    /// Start the clock now.
    pub fn new(budget: Duration, max_child: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
            max_child,
        }
    }

    /// Budget left for the run.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    /// Timeout for the next compiler invocation.
    pub fn child_timeout(&self) -> Duration {
        self.remaining().min(self.max_child)
    }
}

/// One compiler invocation.
enum Invocation {
    BootImage(BootImageArgs),
    SystemServer(SystemServerArgs),
}

impl Invocation {
    fn label(&self) -> String {
        match self {
            Self::BootImage(args) => format!("{} {} boot image", args.isa, args.label),
            Self::SystemServer(args) => format!("{} {}", args.isa, args.dex_location),
        }
    }

    fn set_outputs(&mut self, staged: ArtifactTriple) {
        match self {
            Self::BootImage(args) => args.outputs = staged,
            Self::SystemServer(args) => args.outputs = staged,
        }
    }

    fn command_line(&self, program: &Path) -> String {
        match self {
            Self::BootImage(args) => args.command(program).command_line(),
            Self::SystemServer(args) => args.command(program).command_line(),
        }
    }

    fn run(&self, backend: &dyn CompilerBackend, timeout: Duration) -> ExecResult {
        match self {
            Self::BootImage(args) => backend.compile_boot_image(args, timeout),
            Self::SystemServer(args) => backend.compile_system_server_jar(args, timeout),
        }
    }
}

/// Drives the compiler over a [`CompilationOptions`] work list.
pub struct Orchestrator<'a> {
    config: &'a OdrConfig,
    layout: Layout<'a>,
    backend: &'a dyn CompilerBackend,
    deadline: Deadline,
}

impl<'a> Orchestrator<'a> {
    /// Orchestrator compiling with `backend` within `deadline`.
    pub fn new(config: &'a OdrConfig, backend: &'a dyn CompilerBackend, deadline: Deadline) -> Self {
        Self {
            config,
            layout: Layout::new(config),
            backend,
            deadline,
        }
    }

    /// Compile everything in `options`.
    ///
    /// Returns `CompilationSuccess`, `CompilationFailed`, or `CleanupFailed`
    /// when the cache could not be prepared.
    pub fn compile(
        &self,
        options: &CompilationOptions,
        modules: &[ModuleInfo],
        metrics: &mut OdrMetrics,
    ) -> ExitCode {
        metrics.set_stage(Stage::Preparation);
        if let Err(e) = self.prepare(modules) {
            error!("{e}");
            metrics.set_status(e.status());
            return ExitCode::CleanupFailed;
        }
        let staging = match StagingArea::prepare(
            self.config.staging_dir.as_deref(),
            &self.config.artifact_dir,
        ) {
            Ok(staging) => staging,
            Err(e) => {
                error!("{e}");
                metrics.set_status(Status::StagingFailed);
                return ExitCode::CleanupFailed;
            }
        };

        let mut first_failure: Option<(Stage, Status)> = None;
        let mut system_server_isa_failed = false;

        for (index, &isa) in self.config.boot_classpath_isas.iter().enumerate() {
            let Some(&images) = options.boot_images.get(&isa) else {
                continue;
            };
            let stage = if index == 0 {
                Stage::PrimaryBootClasspath
            } else {
                Stage::SecondaryBootClasspath
            };
            metrics.set_stage(stage);
            if let Err(e) = self.compile_boot_images(isa, images, stage, staging.dir(), metrics) {
                error!("{isa} boot images failed: {e}");
                first_failure.get_or_insert((stage, e.status()));
                if isa == self.config.system_server_isa {
                    system_server_isa_failed = true;
                }
            }
        }

        if !options.system_server_jars.is_empty() {
            if system_server_isa_failed {
                warn!(
                    "skipping system server: boot images for {} are not usable",
                    self.config.system_server_isa
                );
            } else {
                metrics.set_stage(Stage::SystemServerClasspath);
                if let Err(e) =
                    self.compile_system_server(&options.system_server_jars, staging.dir(), metrics)
                {
                    first_failure.get_or_insert((Stage::SystemServerClasspath, e.status()));
                }
            }
        }

        if let Some((stage, status)) = first_failure {
            metrics.set_stage(stage);
            metrics.set_status(status);
            if !self.config.dry_run {
                if let Err(e) = staging.remove() {
                    warn!("{e}");
                }
            }
            return ExitCode::CompilationFailed;
        }

        metrics.set_stage(Stage::Complete);
        metrics.set_status(Status::Ok);
        ExitCode::CompilationSuccess
    }

    /// Ready the cache and record the inputs about to be compiled.
    fn prepare(&self, modules: &[ModuleInfo]) -> Result<(), OdrError> {
        let dir = &self.config.artifact_dir;
        fsutil::ensure_dir(dir)?;
        if self.config.refresh {
            cleanup::refresh_existing_artifacts(dir)?;
        }

        let path = self.config.manifest_path();
        fsutil::remove_file(&path)?;
        let digest = CacheManifest::current(self.config, modules)?.save(&path)?;
        info!("wrote {} (sha256 {digest})", path.display());
        Ok(())
    }

    fn compile_boot_images(
        &self,
        isa: Isa,
        images: BootImages,
        stage: Stage,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) -> Result<(), OdrError> {
        let started = Instant::now();
        let ty = match (images.primary, images.mainline_extension) {
            (true, true) => BcpCompilationType::PrimaryAndMainline,
            (true, false) => BcpCompilationType::Primary,
            (false, _) => BcpCompilationType::MainlineOnly,
        };
        metrics.set_bcp_compilation_type(stage, ty);

        if images.primary && self.config.minimal {
            self.compile_primary_boot_image(isa, true, stage, started, staging, metrics)?;
            info!("{isa}: minimal boot image generated as requested");
        } else if images.primary {
            let primary = self.compile_primary_boot_image(isa, false, stage, started, staging, metrics);
            if let Err(e) = primary {
                warn!("{isa} primary boot image failed: {e}");
                self.ensure_minimal_boot_image(isa, stage, started, staging, metrics);
                return Err(e);
            }
            if !self.config.dry_run {
                for path in self.layout.primary_boot_image(false, true, isa).paths() {
                    if let Err(e) = fsutil::remove_file(path) {
                        warn!("{e}");
                    }
                }
            }
        }

        if images.mainline_extension {
            self.compile_mainline_extension(isa, stage, started, staging, metrics)?;
        }
        Ok(())
    }

    /// Fall back to a boot image of the runtime's own jars, keeping a valid one.
    fn ensure_minimal_boot_image(
        &self,
        isa: Isa,
        stage: Stage,
        started: Instant,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) {
        let minimal = self.layout.primary_boot_image(false, true, isa);
        if minimal.check_exists(true, &mut Vec::new()).is_ok() {
            info!("{isa}: keeping existing minimal boot image");
            return;
        }
        match self.compile_primary_boot_image(isa, true, stage, started, staging, metrics) {
            Ok(()) => info!("{isa}: minimal boot image generated"),
            Err(e) => warn!("{isa} minimal boot image failed: {e}"),
        }
    }

    fn compile_primary_boot_image(
        &self,
        isa: Isa,
        minimal: bool,
        stage: Stage,
        started: Instant,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) -> Result<(), OdrError> {
        let install = self.layout.primary_boot_image(false, minimal, isa);
        let jars = if minimal {
            self.config.art_boot_classpath()
        } else {
            self.config.dex2oat_boot_classpath.clone()
        };
        let (compiler_filter, profiles) = self.boot_image_filter()?;
        let etc = self.config.android_root.join("etc");

        let args = BootImageArgs {
            label: if minimal { "minimal" } else { "primary" },
            isa,
            dex_files: jars.iter().map(|jar| self.config.resolve(jar)).collect(),
            dex_locations: jars.clone(),
            boot_classpath: jars,
            boot_images: Vec::new(),
            boot_image_components: Vec::new(),
            outputs: install.clone(),
            oat_location: install.oat.clone(),
            compiler_filter,
            profiles,
            dirty_image_objects: optional_input(etc.join("dirty-image-objects")),
            preloaded_classes: optional_input(etc.join("preloaded-classes")),
            concurrency: self.concurrency()?,
        };
        self.run_unit(Invocation::BootImage(args), &install, stage, started, staging, metrics)
    }

    fn compile_mainline_extension(
        &self,
        isa: Isa,
        stage: Stage,
        started: Instant,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) -> Result<(), OdrError> {
        let install = self
            .layout
            .mainline_extension(false, isa)
            .ok_or_else(|| OdrError::Unknown("boot classpath has no mainline jars".into()))?;
        let jars = self.config.mainline_boot_classpath();
        let base = self.best_boot_images(isa, false);

        let args = BootImageArgs {
            label: "mainline",
            isa,
            dex_files: jars.iter().map(|jar| self.config.resolve(jar)).collect(),
            dex_locations: jars,
            boot_classpath: self.config.boot_classpath.clone(),
            boot_images: base.iter().map(|t| t.image.clone()).collect(),
            boot_image_components: self.boot_classpath_components(isa, &base),
            outputs: install.clone(),
            oat_location: install.oat.clone(),
            compiler_filter: MAINLINE_EXTENSION_FILTER.to_string(),
            profiles: Vec::new(),
            dirty_image_objects: None,
            preloaded_classes: None,
            concurrency: self.concurrency()?,
        };
        self.run_unit(Invocation::BootImage(args), &install, stage, started, staging, metrics)
    }

    fn compile_system_server(
        &self,
        selected: &BTreeSet<String>,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) -> Result<(), OdrError> {
        let started = Instant::now();
        let base = self.best_boot_images(self.config.system_server_isa, true);
        let jars = self.config.all_system_server_jars();
        let planned = context::plan(
            jars.iter()
                .map(|jar| (jar.as_str(), self.config.in_system_server_classpath(jar))),
        );

        let mut first_error = None;
        for entry in planned.iter().filter(|e| selected.contains(&e.jar)) {
            if let Err(e) = self.compile_system_server_jar(entry, &base, started, staging, metrics) {
                error!("{}: {e}", entry.jar);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn compile_system_server_jar(
        &self,
        entry: &JarContext,
        base: &[ArtifactTriple],
        started: Instant,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) -> Result<(), OdrError> {
        let isa = self.config.system_server_isa;
        let install = self.layout.system_server_artifacts(false, &entry.jar, isa);
        let (compiler_filter, profile) = self.system_server_filter(&entry.jar);

        let args = SystemServerArgs {
            isa,
            dex_location: entry.jar.clone(),
            boot_classpath: self.config.boot_classpath.clone(),
            boot_images: base.iter().map(|t| t.image.clone()).collect(),
            boot_image_components: self.boot_classpath_components(isa, base),
            outputs: install.clone(),
            oat_location: install.oat.clone(),
            compiler_filter,
            profile,
            class_loader_context: entry.context.encode(entry.in_classpath),
            class_loader_context_files: entry
                .context
                .jars()
                .map(|jar| self.config.resolve(jar))
                .collect(),
            dex_file: self.config.resolve(&entry.jar),
            concurrency: self.concurrency()?,
        };
        self.run_unit(
            Invocation::SystemServer(args),
            &install,
            Stage::SystemServerClasspath,
            started,
            staging,
            metrics,
        )
    }

    /// Stage, compile and install one unit.
    fn run_unit(
        &self,
        mut invocation: Invocation,
        install: &ArtifactTriple,
        stage: Stage,
        started: Instant,
        staging: &Path,
        metrics: &mut OdrMetrics,
    ) -> Result<(), OdrError> {
        fsutil::check_compilation_space(&self.config.artifact_dir)?;
        let (staged_files, staged) = StagedFiles::create(staging, install)?;
        invocation.set_outputs(staged);
        let label = invocation.label();

        if self.config.dry_run {
            info!("dry run, not compiling {label}");
            debug!("{}", invocation.command_line(&self.config.dex2oat));
            return Ok(());
        }

        let timeout = self.deadline.child_timeout();
        if timeout.is_zero() {
            metrics.set_compiler_result(stage, started.elapsed(), ExecResult::timed_out());
            return Err(OdrError::TimedOut(timeout));
        }

        info!("compiling {label}");
        debug!("{}", invocation.command_line(&self.config.dex2oat));
        let exec = {
            let _t = Timer::start(label);
            invocation.run(self.backend, timeout)
        };
        metrics.set_compiler_result(stage, started.elapsed(), exec);
        exec.check(timeout)?;
        staged_files.commit()
    }

    /// Filter and profiles for primary and minimal boot images.
    fn boot_image_filter(&self) -> Result<(String, Vec<PathBuf>), OdrError> {
        let explicit = &self.config.boot_image_compiler_filter;
        if !explicit.is_empty() {
            return Ok((explicit.clone(), Vec::new()));
        }
        let candidates = [
            self.config.art_root.join("etc/boot-image.prof"),
            self.config.android_root.join("etc/boot-image.prof"),
        ];
        let profiles: Vec<PathBuf> = candidates.into_iter().filter(|p| is_file(p)).collect();
        if profiles.is_empty() {
            return Err(OdrError::io(
                "missing boot image profile",
                &self.config.art_root.join("etc/boot-image.prof"),
                std::io::ErrorKind::NotFound.into(),
            ));
        }
        Ok(("speed-profile".to_string(), profiles))
    }

    /// `speed-profile` needs `<android_root>/framework/<jar name>.prof`; without
    /// one the jar is compiled with `speed`.
    fn system_server_filter(&self, jar: &str) -> (String, Option<PathBuf>) {
        let filter = &self.config.system_server_compiler_filter;
        if filter != "speed-profile" {
            return (filter.clone(), None);
        }
        let mut name = OsString::from(Path::new(jar).file_name().unwrap_or_default());
        name.push(".prof");
        let profile = self.config.android_root.join("framework").join(name);
        if is_file(&profile) {
            (filter.clone(), Some(profile))
        } else {
            debug!("no profile for {jar}, compiling with speed");
            ("speed".to_string(), None)
        }
    }

    fn concurrency(&self) -> Result<Concurrency, OdrError> {
        Concurrency::parse(self.config.dex2oat_threads, &self.config.dex2oat_cpu_set)
    }

    /// One entry per boot classpath jar: the files of the image in `images`
    /// that the jar leads, or nothing.
    fn boot_classpath_components(&self, isa: Isa, images: &[ArtifactTriple]) -> Vec<BootImageComponent> {
        self.config
            .boot_classpath
            .iter()
            .map(|jar| {
                [false, true]
                    .into_iter()
                    .map(|on_system| self.layout.boot_image_for_jar(on_system, jar, isa))
                    .find(|triple| images.contains(triple))
                    .map_or_else(BootImageComponent::default, |t| BootImageComponent::from_triple(&t))
            })
            .collect()
    }

    /// Boot images to compile against: the cache's if present, else the system's.
    ///
    /// The mainline extension comes from the same partition as the primary
    /// image whenever the primary image comes from the cache.
    pub fn best_boot_images(&self, isa: Isa, include_mainline: bool) -> Vec<ArtifactTriple> {
        let mut ignored = Vec::new();
        let data_primary = self.layout.primary_boot_image(false, false, isa);
        let primary_on_data = data_primary.check_exists(true, &mut ignored).is_ok();

        let mut images = Vec::new();
        if primary_on_data {
            images.push(data_primary);
        } else {
            images.push(self.layout.primary_boot_image(true, false, isa));
            let framework = self.layout.system_framework_extension(isa);
            if is_file(&framework.image) {
                images.push(framework);
            }
        }

        if include_mainline {
            let extension = match self.layout.mainline_extension(false, isa) {
                Some(data) if data.check_exists(true, &mut ignored).is_ok() => Some(data),
                _ if primary_on_data => None,
                _ => self.layout.mainline_extension(true, isa),
            };
            images.extend(extension);
        }
        images
    }
}

/// `path` if it exists; a missing hint only costs quality.
fn optional_input(path: PathBuf) -> Option<PathBuf> {
    if is_file(&path) {
        Some(path)
    } else {
        warn!("missing {}, continuing without it", path.display());
        None
    }
}
