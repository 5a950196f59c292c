//! Artifact naming and locations.
//!
//! Every compilation unit produces an image, an oat and a vdex file that are
//! created and removed together. Their locations are derived from the
//! configuration alone.

use std::path::{Path, PathBuf};

use crate::component::is_file;
use crate::config::OdrConfig;
use crate::isa::Isa;

/// The image/oat/vdex files produced by one compilation unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactTriple {
    /// `.art` image.
    pub image: PathBuf,
    /// `.oat` (boot image) or `.odex` (system server) file.
    pub oat: PathBuf,
    /// `.vdex` file.
    pub vdex: PathBuf,
}

impl ArtifactTriple {
    /// Triple for a boot image whose image file is `image`.
    pub fn for_boot_image(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            oat: image.with_extension("oat"),
            vdex: image.with_extension("vdex"),
        }
    }

    /// Triple for a system server jar whose odex file is `odex`.
    pub fn for_system_server(odex: &Path) -> Self {
        Self {
            image: odex.with_extension("art"),
            oat: odex.to_path_buf(),
            vdex: odex.with_extension("vdex"),
        }
    }

    /// All three paths, image first.
    pub fn paths(&self) -> [&Path; 3] {
        [&self.image, &self.oat, &self.vdex]
    }

    /// Check the files exist, optionally ignoring the image.
    ///
    /// Every path examined is appended to `checked`, present or not, so that
    /// cleanup keeps files that were just looked at. Returns the first missing
    /// path on failure.
    pub fn check_exists(
        &self,
        require_image: bool,
        checked: &mut Vec<PathBuf>,
    ) -> Result<(), PathBuf> {
        let required: &[&Path] = if require_image {
            &[&self.image, &self.oat, &self.vdex]
        } else {
            &[&self.oat, &self.vdex]
        };
        for path in required {
            if !is_file(path) {
                return Err(path.to_path_buf());
            }
        }
        checked.extend(required.iter().map(|p| p.to_path_buf()));
        // An optional image that happens to exist is kept too.
        if !require_image && is_file(&self.image) {
            checked.push(self.image.clone());
        }
        Ok(())
    }
}

/// Location rules for every artifact, bound to a configuration.
#[derive(Clone, Copy)]
pub struct Layout<'a> {
    config: &'a OdrConfig,
}

impl<'a> Layout<'a> {
    /// Layout for `config`.
    pub fn new(config: &'a OdrConfig) -> Self {
        Self { config }
    }

    /// Directory holding boot images for `isa`.
    fn boot_image_dir(&self, on_system: bool, isa: Isa) -> PathBuf {
        if on_system {
            self.config.android_root.join("framework").join(isa.as_str())
        } else {
            self.config.artifact_dir.join(isa.as_str())
        }
    }

    /// Primary boot image (`boot.art`), or the minimal fallback (`boot_minimal.art`).
    ///
    /// The minimal image only exists in the writable cache.
    pub fn primary_boot_image(&self, on_system: bool, minimal: bool, isa: Isa) -> ArtifactTriple {
        let name = if minimal { "boot_minimal.art" } else { "boot.art" };
        ArtifactTriple::for_boot_image(&self.boot_image_dir(on_system && !minimal, isa).join(name))
    }

    /// The framework extension of a split system boot image.
    pub fn system_framework_extension(&self, isa: Isa) -> ArtifactTriple {
        ArtifactTriple::for_boot_image(&self.boot_image_dir(true, isa).join("boot-framework.art"))
    }

    /// Mainline extension image, named after the first updatable boot classpath jar.
    ///
    /// `None` when the boot classpath has no updatable tail.
    pub fn mainline_extension(&self, on_system: bool, isa: Isa) -> Option<ArtifactTriple> {
        let first = self.config.mainline_boot_classpath().into_iter().next()?;
        let stem = Path::new(&first).file_stem()?.to_string_lossy().into_owned();
        Some(ArtifactTriple::for_boot_image(
            &self.boot_image_dir(on_system, isa).join(format!("boot-{stem}.art")),
        ))
    }

    /// Boot image named after `jar`, as if `jar` led its own image.
    ///
    /// The first primary boot classpath jar maps to `boot.art`, any other jar to
    /// `boot-<stem>.art`. Only the leading jar of an image has files under its
    /// name; the rest of the jars it covers map to files that do not exist.
    pub fn boot_image_for_jar(&self, on_system: bool, jar: &str, isa: Isa) -> ArtifactTriple {
        let dir = self.boot_image_dir(on_system, isa);
        if self.config.dex2oat_boot_classpath.first().is_some_and(|first| first == jar) {
            return ArtifactTriple::for_boot_image(&dir.join("boot.art"));
        }
        let stem = Path::new(jar).file_stem().unwrap_or_default().to_string_lossy();
        ArtifactTriple::for_boot_image(&dir.join(format!("boot-{stem}.art")))
    }

    /// Artifacts of one system server jar.
    ///
    /// On the system partition they sit next to the jar under `oat/<isa>/`;
    /// in the cache the jar's full path is flattened into the file name.
    pub fn system_server_artifacts(&self, on_system: bool, jar: &str, isa: Isa) -> ArtifactTriple {
        let odex = if on_system {
            let resolved = self.config.resolve(jar);
            let dir = resolved.parent().unwrap_or(Path::new("/"));
            let stem = resolved.file_stem().unwrap_or_default().to_string_lossy();
            dir.join("oat").join(isa.as_str()).join(format!("{stem}.odex"))
        } else {
            let flat = jar.trim_start_matches('/').replace('/', "@");
            self.config
                .artifact_dir
                .join(isa.as_str())
                .join(format!("{flat}@classes.odex"))
        };
        ArtifactTriple::for_system_server(&odex)
    }
}

/// Staging path for an install path: same file name, inside `staging_dir`.
pub fn staging_location(staging_dir: &Path, install: &Path) -> PathBuf {
    staging_dir.join(install.file_name().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn boot_image_locations_per_partition() {
        let cfg = test_config(Path::new("/r"));
        let layout = Layout::new(&cfg);

        let data = layout.primary_boot_image(false, false, Isa::Arm64);
        assert_eq!(data.image, PathBuf::from("/r/data/dalvik-cache/arm64/boot.art"));
        assert_eq!(data.oat, PathBuf::from("/r/data/dalvik-cache/arm64/boot.oat"));
        assert_eq!(data.vdex, PathBuf::from("/r/data/dalvik-cache/arm64/boot.vdex"));

        let sys = layout.primary_boot_image(true, false, Isa::Arm);
        assert_eq!(sys.image, PathBuf::from("/r/system/framework/arm/boot.art"));

        let minimal = layout.primary_boot_image(true, true, Isa::Arm64);
        assert_eq!(minimal.image, PathBuf::from("/r/data/dalvik-cache/arm64/boot_minimal.art"));
    }

    #[test]
    fn mainline_extension_is_named_after_first_updatable_jar() {
        let cfg = test_config(Path::new("/r"));
        let ext = Layout::new(&cfg).mainline_extension(false, Isa::Arm64).unwrap();
        assert_eq!(ext.image, PathBuf::from("/r/data/dalvik-cache/arm64/boot-framework-wifi.art"));

        let mut no_tail = cfg.clone();
        no_tail.boot_classpath.truncate(2);
        assert!(Layout::new(&no_tail).mainline_extension(false, Isa::Arm64).is_none());
    }

    #[test]
    fn leading_jars_name_their_images() {
        let cfg = test_config(Path::new("/r"));
        let layout = Layout::new(&cfg);
        let [core, framework, wifi] = [0, 1, 2].map(|i| cfg.boot_classpath[i].as_str());

        assert_eq!(
            layout.boot_image_for_jar(false, core, Isa::Arm64),
            layout.primary_boot_image(false, false, Isa::Arm64)
        );
        assert_eq!(
            layout.boot_image_for_jar(true, framework, Isa::Arm64),
            layout.system_framework_extension(Isa::Arm64)
        );
        assert_eq!(
            Some(layout.boot_image_for_jar(true, wifi, Isa::Arm)),
            layout.mainline_extension(true, Isa::Arm)
        );
    }

    #[test]
    fn system_server_locations_per_partition() {
        let cfg = test_config(Path::new("/r"));
        let layout = Layout::new(&cfg);
        let jar = "/r/system/framework/services.jar";

        let data = layout.system_server_artifacts(false, jar, Isa::Arm64);
        assert_eq!(
            data.oat,
            PathBuf::from("/r/data/dalvik-cache/arm64/r@system@framework@services.jar@classes.odex")
        );
        assert_eq!(
            data.vdex,
            PathBuf::from("/r/data/dalvik-cache/arm64/r@system@framework@services.jar@classes.vdex")
        );

        let sys = layout.system_server_artifacts(true, jar, Isa::Arm64);
        assert_eq!(sys.oat, PathBuf::from("/r/system/framework/oat/arm64/services.odex"));
        assert_eq!(sys.image, PathBuf::from("/r/system/framework/oat/arm64/services.art"));
    }

    #[test]
    fn partial_triple_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let triple = ArtifactTriple::for_boot_image(&dir.path().join("boot.art"));
        std::fs::write(&triple.image, b"i").unwrap();
        std::fs::write(&triple.oat, b"o").unwrap();

        let mut checked = Vec::new();
        assert_eq!(triple.check_exists(true, &mut checked), Err(triple.vdex.clone()));
        assert!(checked.is_empty());

        std::fs::write(&triple.vdex, b"v").unwrap();
        assert!(triple.check_exists(true, &mut checked).is_ok());
        assert_eq!(checked.len(), 3);
    }

    #[test]
    fn optional_image_is_kept_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let triple = ArtifactTriple::for_system_server(&dir.path().join("a.odex"));
        std::fs::write(&triple.oat, b"o").unwrap();
        std::fs::write(&triple.vdex, b"v").unwrap();

        let mut checked = Vec::new();
        assert!(triple.check_exists(false, &mut checked).is_ok());
        assert_eq!(checked.len(), 2);
        std::fs::write(&triple.image, b"i").unwrap();
        checked.clear();
        assert!(triple.check_exists(false, &mut checked).is_ok());
        assert_eq!(checked.len(), 3);
    }
}
