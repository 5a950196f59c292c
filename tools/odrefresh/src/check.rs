//! Turning trust verdicts into a work list.
//!
//! The checker looks for the artifacts each verdict vouches for, system
//! partition first, and schedules whatever is found on neither partition.
//! Every cache file it looks at goes on the keep-list handed to cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::ExitCode;
use crate::artifacts::Layout;
use crate::cache::CacheManifest;
use crate::cleanup;
use crate::config::OdrConfig;
use crate::isa::Isa;
use crate::metrics::{OdrMetrics, Stage, Status, Trigger};
use crate::modules::{self, ModuleInfo};
use crate::precondition::{self, TrustVerdict};

/// Boot images to build for one instruction set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BootImages {
    /// The primary image.
    pub primary: bool,
    /// The mainline extension.
    pub mainline_extension: bool,
}

impl BootImages {
    /// Number of images to build.
    pub fn count(self) -> usize {
        usize::from(self.primary) + usize::from(self.mainline_extension)
    }
}

/// The work order for one compile run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilationOptions {
    /// Boot images per instruction set. Instruction sets with no work are absent.
    pub boot_images: BTreeMap<Isa, BootImages>,
    /// System server jars to compile.
    pub system_server_jars: BTreeSet<String>,
}

impl CompilationOptions {
    /// Everything the configuration describes.
    pub fn all(config: &OdrConfig) -> Self {
        let has_mainline = !config.mainline_boot_classpath().is_empty();
        Self {
            boot_images: config
                .boot_classpath_isas
                .iter()
                .map(|&isa| {
                    let images = BootImages {
                        primary: true,
                        mainline_extension: has_mainline,
                    };
                    (isa, images)
                })
                .collect(),
            system_server_jars: config.all_system_server_jars().into_iter().collect(),
        }
    }

    /// Total number of compiler invocations scheduled, fallbacks aside.
    pub fn unit_count(&self) -> usize {
        self.boot_images.values().map(|b| b.count()).sum::<usize>() + self.system_server_jars.len()
    }

    /// Returns `true` if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.unit_count() == 0
    }
}

/// Outcome of checking the artifacts.
#[derive(Debug)]
pub struct CheckResult {
    /// `Okay`, `CompilationRequired` or `CleanupFailed`.
    pub exit_code: ExitCode,
    /// What to compile when compilation is required.
    pub options: CompilationOptions,
}

/// Decide what needs compiling and prune the cache of everything else.
///
/// Without the runtime module in `modules` nothing is trusted.
pub fn check_artifacts_are_up_to_date(
    config: &OdrConfig,
    modules: &[ModuleInfo],
    metrics: &mut OdrMetrics,
) -> CheckResult {
    metrics.set_stage(Stage::Check);

    if let Some(art) = modules::art_module(modules) {
        metrics.set_art_apex_version(art.version_code);
    }

    let manifest = CacheManifest::load(&config.manifest_path());
    let system = precondition::check_system(config, modules);
    let data = precondition::check_data(config, modules, manifest.as_ref());
    debug!("system verdict: {system:?}");
    debug!("data verdict: {data:?}");

    let mut checker = Checker {
        config,
        layout: Layout::new(config),
        system,
        data,
        keep: vec![config.manifest_path()],
    };
    let mut options = CompilationOptions::default();

    for &isa in &config.boot_classpath_isas {
        let images = checker.check_boot_images(isa, metrics);
        if images.count() == 0 {
            continue;
        }
        info!(
            "{isa}: primary boot image {}, mainline extension {}",
            needs(images.primary),
            needs(images.mainline_extension)
        );
        options.boot_images.insert(isa, images);
        if isa == config.system_server_isa {
            // Boot images are rebuilt, so everything linked against them is too.
            options.system_server_jars = config.all_system_server_jars().into_iter().collect();
        }
    }

    if options.system_server_jars.is_empty() {
        options.system_server_jars = checker.check_system_server(metrics);
    }

    let exit_code = if !options.is_empty() {
        info!("{} compilation units required", options.unit_count());
        ExitCode::CompilationRequired
    } else if !checker.data.is_all_ok() {
        // Artifacts are fine but the manifest is stale; a compile run rewrites it.
        metrics.set_trigger(checker.data.trigger());
        info!("cache manifest is out of date");
        ExitCode::CompilationRequired
    } else {
        info!("artifacts are up to date");
        ExitCode::Okay
    };

    if let Err(e) = cleanup::cleanup_artifact_directory(&config.artifact_dir, &checker.keep) {
        warn!("{e}");
        metrics.set_status(Status::IoError);
        return CheckResult {
            exit_code: ExitCode::CleanupFailed,
            options,
        };
    }

    metrics.set_status(Status::Ok);
    CheckResult { exit_code, options }
}

fn needs(required: bool) -> &'static str {
    if required { "required" } else { "ok" }
}

struct Checker<'a> {
    config: &'a OdrConfig,
    layout: Layout<'a>,
    system: TrustVerdict,
    data: TrustVerdict,
    keep: Vec<PathBuf>,
}

impl Checker<'_> {
    fn check_boot_images(&mut self, isa: Isa, metrics: &mut OdrMetrics) -> BootImages {
        let mut ignored = Vec::new();
        let has_mainline = self.layout.mainline_extension(false, isa).is_some();

        let mut primary_on_system = false;
        let mut mainline_on_system = false;
        if self.system.primary_boot_image_ok() && self.system_primary_exists(isa, &mut ignored) {
            primary_on_system = true;
            mainline_on_system = !has_mainline
                || (self.system.mainline_extension_ok()
                    && self
                        .layout
                        .mainline_extension(true, isa)
                        .is_some_and(|t| t.check_exists(true, &mut ignored).is_ok()));
        }
        if primary_on_system && mainline_on_system {
            debug!("{isa}: boot images on system are usable");
            return BootImages::default();
        }

        let mut primary_on_data = false;
        if self.data.primary_boot_image_ok() {
            let primary = self.layout.primary_boot_image(false, false, isa);
            if primary.check_exists(true, &mut self.keep).is_ok() {
                primary_on_data = true;
            } else if !primary_on_system {
                info!("{isa}: primary boot image missing from the cache");
                metrics.set_trigger(Trigger::MissingArtifacts);
                let minimal = self.layout.primary_boot_image(false, true, isa);
                if minimal.check_exists(true, &mut self.keep).is_ok() {
                    debug!("{isa}: keeping minimal boot image");
                }
            }
        } else if !primary_on_system {
            metrics.set_trigger(self.data.trigger());
        }

        let mut mainline_on_data = false;
        if has_mainline && !mainline_on_system && (primary_on_system || primary_on_data) {
            if self.data.mainline_extension_ok() {
                let exists = self
                    .layout
                    .mainline_extension(false, isa)
                    .is_some_and(|t| t.check_exists(true, &mut self.keep).is_ok());
                if exists {
                    mainline_on_data = true;
                } else {
                    info!("{isa}: mainline extension missing from the cache");
                    metrics.set_trigger(Trigger::MissingArtifacts);
                }
            } else {
                metrics.set_trigger(self.data.trigger());
            }
        }

        let primary = !primary_on_system && !primary_on_data;
        BootImages {
            primary,
            mainline_extension: has_mainline && !mainline_on_system && !mainline_on_data,
        }
    }

    /// The system primary image, with its framework extension if the build split it off.
    fn system_primary_exists(&self, isa: Isa, checked: &mut Vec<PathBuf>) -> bool {
        if self.layout.primary_boot_image(true, false, isa).check_exists(true, checked).is_err() {
            return false;
        }
        let framework = self.layout.system_framework_extension(isa);
        !framework.image.exists() || framework.check_exists(true, checked).is_ok()
    }

    fn check_system_server(&mut self, metrics: &mut OdrMetrics) -> BTreeSet<String> {
        let isa = self.config.system_server_isa;
        let jars = self.config.all_system_server_jars();
        let mut ignored = Vec::new();

        let missing_on_system: BTreeSet<&String> = if self.system.system_server_ok() {
            jars.iter()
                .filter(|jar| {
                    self.layout
                        .system_server_artifacts(true, jar, isa)
                        .check_exists(false, &mut ignored)
                        .is_err()
                })
                .collect()
        } else {
            jars.iter().collect()
        };
        if missing_on_system.is_empty() {
            debug!("system server artifacts on system are usable");
            return BTreeSet::new();
        }

        let missing_on_data: BTreeSet<&String> = jars
            .iter()
            .filter(|jar| {
                !self.data.system_server_jar_ok(jar)
                    || self
                        .layout
                        .system_server_artifacts(false, jar, isa)
                        .check_exists(true, &mut self.keep)
                        .is_err()
            })
            .collect();

        let compile: BTreeSet<String> = missing_on_system
            .intersection(&missing_on_data)
            .map(|jar| (*jar).clone())
            .collect();
        if compile.iter().any(|jar| !self.data.system_server_jar_ok(jar)) {
            metrics.set_trigger(self.data.trigger());
        } else if !compile.is_empty() {
            metrics.set_trigger(Trigger::MissingArtifacts);
        }
        compile
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::artifacts::ArtifactTriple;
    use crate::cache::tests::art_info;
    use crate::component::tests::write_jar;
    use crate::config::tests::test_config;

    fn setup(root: &Path) -> OdrConfig {
        let cfg = test_config(root);
        let jars = cfg.boot_classpath.iter().chain(&cfg.system_server_classpath);
        for jar in jars.chain(&cfg.standalone_system_server_jars) {
            write_jar(&cfg.resolve(jar), &[jar.as_bytes()]);
        }
        cfg
    }

    fn touch(triple: &ArtifactTriple) {
        for path in triple.paths() {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"artifact").unwrap();
        }
    }

    fn write_manifest(cfg: &OdrConfig) {
        CacheManifest::current(cfg, &[art_info()]).unwrap().save(&cfg.manifest_path()).unwrap();
    }

    fn populate_cache(cfg: &OdrConfig) {
        let layout = Layout::new(cfg);
        for &isa in &cfg.boot_classpath_isas {
            touch(&layout.primary_boot_image(false, false, isa));
            touch(&layout.mainline_extension(false, isa).unwrap());
        }
        for jar in cfg.all_system_server_jars() {
            touch(&layout.system_server_artifacts(false, &jar, cfg.system_server_isa));
        }
    }

    #[test]
    fn first_run_requires_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[art_info()], &mut metrics);

        assert_eq!(result.exit_code, ExitCode::CompilationRequired);
        assert_eq!(result.options, CompilationOptions::all(&cfg));
        assert_eq!(metrics.trigger(), Some(Trigger::Unknown));
    }

    #[test]
    fn missing_runtime_module_requires_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        write_manifest(&cfg);
        populate_cache(&cfg);
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[], &mut metrics);

        assert_eq!(result.options, CompilationOptions::all(&cfg));
        assert!(!cfg.artifact_dir.join("arm64/boot.oat").exists());
    }

    #[test]
    fn complete_cache_is_okay_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        write_manifest(&cfg);
        populate_cache(&cfg);
        let stray = cfg.artifact_dir.join("arm64/stale.odex");
        fs::write(&stray, b"x").unwrap();
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[art_info()], &mut metrics);

        assert_eq!(result.exit_code, ExitCode::Okay);
        assert!(result.options.is_empty());
        assert!(cfg.artifact_dir.join("arm64/boot.art").exists());
        assert!(cfg.manifest_path().exists());
        assert!(!stray.exists());
    }

    #[test]
    fn missing_secondary_image_is_rebuilt_with_its_extension() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        write_manifest(&cfg);
        populate_cache(&cfg);
        fs::remove_file(cfg.artifact_dir.join("arm/boot.vdex")).unwrap();
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[art_info()], &mut metrics);

        assert_eq!(result.exit_code, ExitCode::CompilationRequired);
        let arm = result.options.boot_images[&Isa::Arm];
        assert!(arm.primary);
        assert!(arm.mainline_extension);
        assert!(!result.options.boot_images.contains_key(&Isa::Arm64));
        assert!(result.options.system_server_jars.is_empty());
        assert_eq!(metrics.trigger(), Some(Trigger::MissingArtifacts));
        // The incomplete triple is not kept.
        assert!(!cfg.artifact_dir.join("arm/boot.art").exists());
    }

    #[test]
    fn rebuilding_system_server_isa_rebuilds_all_jars() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        write_manifest(&cfg);
        populate_cache(&cfg);
        fs::remove_file(cfg.artifact_dir.join("arm64/boot.oat")).unwrap();
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[art_info()], &mut metrics);

        assert_eq!(result.options.system_server_jars.len(), 3);
    }

    #[test]
    fn usable_system_artifacts_need_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        write_manifest(&cfg);
        let layout = Layout::new(&cfg);
        for &isa in &cfg.boot_classpath_isas {
            touch(&layout.primary_boot_image(true, false, isa));
            touch(&layout.mainline_extension(true, isa).unwrap());
        }
        for jar in cfg.all_system_server_jars() {
            let triple = layout.system_server_artifacts(true, &jar, cfg.system_server_isa);
            for path in [&triple.oat, &triple.vdex] {
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"artifact").unwrap();
            }
        }
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[art_info()], &mut metrics);

        assert_eq!(result.exit_code, ExitCode::Okay);
        assert!(result.options.is_empty());
    }

    #[test]
    fn stale_manifest_alone_requires_a_compile_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        let layout = Layout::new(&cfg);
        for &isa in &cfg.boot_classpath_isas {
            touch(&layout.primary_boot_image(true, false, isa));
            touch(&layout.mainline_extension(true, isa).unwrap());
        }
        for jar in cfg.all_system_server_jars() {
            touch(&layout.system_server_artifacts(true, &jar, cfg.system_server_isa));
        }
        let mut metrics = OdrMetrics::default();

        let result = check_artifacts_are_up_to_date(&cfg, &[art_info()], &mut metrics);

        assert_eq!(result.exit_code, ExitCode::CompilationRequired);
        assert!(result.options.is_empty());
        assert_eq!(metrics.trigger(), Some(Trigger::Unknown));
    }
}
