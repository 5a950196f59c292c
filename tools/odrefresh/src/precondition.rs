//! Trust evaluation for the system partition and the writable cache.
//!
//! Each check yields a [`TrustVerdict`] computed once per run. A verdict never
//! trusts a mainline extension whose primary image is untrusted.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::cache::CacheManifest;
use crate::component::{
    self, changed_system_server_jars, compare_components, compare_system_server_components,
};
use crate::config::OdrConfig;
use crate::metrics::Trigger;
use crate::modules::{self, ModuleInfo};
use crate::props;

/// Which artifact groups of one partition can be used as they are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustVerdict {
    primary_boot_image: bool,
    mainline_extension: bool,
    system_server: bool,
    /// System server jars whose own contents changed.
    stale_jars: BTreeSet<String>,
    trigger: Trigger,
}

impl TrustVerdict {
    /// Everything is trusted.
    pub fn all_ok() -> Self {
        Self {
            primary_boot_image: true,
            mainline_extension: true,
            system_server: true,
            stale_jars: BTreeSet::new(),
            trigger: Trigger::Unknown,
        }
    }

    /// Nothing is trusted.
    pub fn none_ok(trigger: Trigger) -> Self {
        Self {
            primary_boot_image: false,
            mainline_extension: false,
            system_server: false,
            stale_jars: BTreeSet::new(),
            trigger,
        }
    }

    /// Only the primary boot image is trusted.
    ///
    /// System server jars link against the extension, so they go with it.
    pub fn mainline_extension_not_ok(trigger: Trigger) -> Self {
        Self {
            primary_boot_image: true,
            mainline_extension: false,
            system_server: false,
            stale_jars: BTreeSet::new(),
            trigger,
        }
    }

    /// Boot images are trusted, system server artifacts are not.
    pub fn system_server_not_ok(trigger: Trigger) -> Self {
        Self {
            primary_boot_image: true,
            mainline_extension: true,
            system_server: false,
            stale_jars: BTreeSet::new(),
            trigger,
        }
    }

    /// Everything but the artifacts of `jars`, whose contents changed.
    pub fn system_server_jars_changed(jars: impl IntoIterator<Item = String>) -> Self {
        Self {
            stale_jars: jars.into_iter().collect(),
            trigger: Trigger::InputFilesChanged,
            ..Self::all_ok()
        }
    }

    /// The primary boot image can be used.
    pub fn primary_boot_image_ok(&self) -> bool {
        self.primary_boot_image
    }

    /// The mainline extension can be used.
    pub fn mainline_extension_ok(&self) -> bool {
        self.primary_boot_image && self.mainline_extension
    }

    /// All system server artifacts can be used.
    pub fn system_server_ok(&self) -> bool {
        self.system_server && self.stale_jars.is_empty()
    }

    /// The artifacts of system server jar `jar` can be used.
    pub fn system_server_jar_ok(&self, jar: &str) -> bool {
        self.system_server && !self.stale_jars.contains(jar)
    }

    /// Every group is trusted.
    pub fn is_all_ok(&self) -> bool {
        self.primary_boot_image && self.mainline_extension && self.system_server_ok()
    }

    /// Why trust was revoked. Meaningless when [`TrustVerdict::is_all_ok`].
    pub fn trigger(&self) -> Trigger {
        self.trigger
    }
}

/// A build with the userfaultfd GC enabled needs kernel support for it.
fn gc_mode_consistent(config: &OdrConfig) -> bool {
    if config.build_uffd_gc && !config.gc_feature_supported {
        info!("userfaultfd GC is enabled at build time but the kernel does not support it");
        return false;
    }
    true
}

/// Can the artifacts shipped on the system partition be used?
pub fn check_system(config: &OdrConfig, modules: &[ModuleInfo]) -> TrustVerdict {
    for flag in props::TRACKED_FLAGS {
        let current = config.system_properties.get(flag.name).map_or("", String::as_str);
        if current != flag.default {
            info!(
                "system artifacts are out of date: {} is '{current}', built with '{}'",
                flag.name, flag.default
            );
            return TrustVerdict::none_ok(Trigger::ModuleVersionMismatch);
        }
    }

    if !gc_mode_consistent(config) {
        return TrustVerdict::none_ok(Trigger::ModuleVersionMismatch);
    }

    let Some(art) = modules::art_module(modules) else {
        warn!("runtime module is not installed");
        return TrustVerdict::none_ok(Trigger::Unknown);
    };
    if !art.is_factory {
        info!("runtime module has been updated; system artifacts are out of date");
        return TrustVerdict::none_ok(Trigger::ModuleVersionMismatch);
    }

    if let Some(updated) = modules.iter().find(|m| m.is_active && !m.is_factory) {
        info!(
            "module {} has been updated; system mainline extension and system server artifacts are out of date",
            updated.name
        );
        return TrustVerdict::mainline_extension_not_ok(Trigger::ModuleVersionMismatch);
    }

    TrustVerdict::all_ok()
}

/// Are the artifacts in the writable cache consistent with the current inputs?
///
/// `manifest` is what the last compile attempt recorded, `None` if absent or
/// unreadable. Every mismatch is logged; the verdict is the one for the first.
pub fn check_data(
    config: &OdrConfig,
    modules: &[ModuleInfo],
    manifest: Option<&CacheManifest>,
) -> TrustVerdict {
    let Some(manifest) = manifest else {
        return TrustVerdict::none_ok(Trigger::Unknown);
    };
    let mut first: Option<TrustVerdict> = None;

    if manifest.system_properties != config.system_properties {
        info!("tracked system properties changed since the last compilation");
        first.get_or_insert(TrustVerdict::none_ok(Trigger::ModuleVersionMismatch));
    }

    match modules::art_module(modules) {
        None => {
            warn!("runtime module is not installed");
            first.get_or_insert(TrustVerdict::none_ok(Trigger::Unknown));
        }
        Some(art) if !manifest.art_module_info.same_version(art) => {
            info!(
                "runtime module changed ({} {} -> {} {})",
                manifest.art_module_info.version_code,
                manifest.art_module_info.version_name,
                art.version_code,
                art.version_name
            );
            first.get_or_insert(TrustVerdict::none_ok(Trigger::ModuleVersionMismatch));
        }
        Some(_) => {}
    }

    if !gc_mode_consistent(config) {
        first.get_or_insert(TrustVerdict::none_ok(Trigger::ModuleVersionMismatch));
    }

    if manifest.compilation_os_mode {
        info!("cached artifacts were produced in the isolated compilation VM");
    }

    match component::fingerprint_all(config, &config.dex2oat_boot_classpath) {
        Ok(current) => {
            if let Err(reason) = compare_components(&manifest.dex2oat_boot_classpath, &current) {
                info!("primary boot classpath changed: {reason}");
                first.get_or_insert(TrustVerdict::none_ok(Trigger::InputFilesChanged));
            }
        }
        Err(e) => {
            warn!("{e}");
            first.get_or_insert(TrustVerdict::none_ok(Trigger::InputFilesChanged));
        }
    }

    for module in modules.iter().filter(|m| m.is_active) {
        match manifest.module_infos.iter().find(|m| m.name == module.name) {
            None => {
                info!("module {} is new since the last compilation", module.name);
                first.get_or_insert(TrustVerdict::mainline_extension_not_ok(
                    Trigger::ModuleVersionMismatch,
                ));
            }
            Some(cached) if !cached.same_version(module) => {
                info!(
                    "module {} changed ({} -> {})",
                    module.name, cached.version_code, module.version_code
                );
                first.get_or_insert(TrustVerdict::mainline_extension_not_ok(
                    Trigger::ModuleVersionMismatch,
                ));
            }
            Some(_) => {}
        }
    }

    match component::fingerprint_all(config, &config.boot_classpath) {
        Ok(current) => {
            if let Err(reason) = compare_components(&manifest.boot_classpath, &current) {
                info!("boot classpath changed: {reason}");
                first.get_or_insert(TrustVerdict::mainline_extension_not_ok(
                    Trigger::InputFilesChanged,
                ));
            }
        }
        Err(e) => {
            warn!("{e}");
            first.get_or_insert(TrustVerdict::mainline_extension_not_ok(
                Trigger::InputFilesChanged,
            ));
        }
    }

    match component::fingerprint_system_server(config) {
        Ok(current) => {
            if let Err(reason) =
                compare_system_server_components(&manifest.system_server_components, &current)
            {
                info!("system server classpath changed: {reason}");
                first.get_or_insert_with(|| {
                    match changed_system_server_jars(&manifest.system_server_components, &current) {
                        Some(changed) => TrustVerdict::system_server_jars_changed(changed),
                        None => TrustVerdict::system_server_not_ok(Trigger::InputFilesChanged),
                    }
                });
            }
        }
        Err(e) => {
            warn!("{e}");
            first.get_or_insert(TrustVerdict::system_server_not_ok(Trigger::InputFilesChanged));
        }
    }

    first.unwrap_or_else(TrustVerdict::all_ok)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::cache::tests::art_info;
    use crate::component::tests::write_jar;
    use crate::config::tests::test_config;

    fn wifi_module() -> ModuleInfo {
        ModuleInfo {
            name: "com.android.wifi".into(),
            version_code: 7,
            version_name: "7".into(),
            last_update_millis: None,
            is_factory: true,
            is_active: true,
        }
    }

    fn populate(cfg: &OdrConfig) {
        let jars = cfg.boot_classpath.iter().chain(&cfg.system_server_classpath);
        for jar in jars.chain(&cfg.standalone_system_server_jars) {
            write_jar(&cfg.resolve(jar), &[jar.as_bytes()]);
        }
    }

    #[test]
    fn factory_system_is_trusted() {
        let cfg = test_config(Path::new("/r"));
        let verdict = check_system(&cfg, &[art_info(), wifi_module()]);
        assert!(verdict.is_all_ok());
    }

    #[test]
    fn overridden_flag_revokes_all_system_trust() {
        let mut cfg = test_config(Path::new("/r"));
        cfg.system_properties.insert(
            "persist.device_config.runtime_native_boot.odrefresh_test_toggle".into(),
            "true".into(),
        );
        let verdict = check_system(&cfg, &[art_info()]);
        assert_eq!(verdict, TrustVerdict::none_ok(Trigger::ModuleVersionMismatch));
    }

    #[test]
    fn unsupported_gc_mode_revokes_system_trust() {
        let mut cfg = test_config(Path::new("/r"));
        cfg.build_uffd_gc = true;
        cfg.gc_feature_supported = false;
        assert!(!check_system(&cfg, &[art_info()]).primary_boot_image_ok());
    }

    #[test]
    fn updated_runtime_module_trusts_nothing_on_system() {
        let cfg = test_config(Path::new("/r"));
        let mut art = art_info();
        art.is_factory = false;
        let verdict = check_system(&cfg, &[art]);
        assert!(!verdict.primary_boot_image_ok());
        assert_eq!(verdict.trigger(), Trigger::ModuleVersionMismatch);
    }

    #[test]
    fn updated_other_module_keeps_system_primary_image() {
        let cfg = test_config(Path::new("/r"));
        let mut wifi = wifi_module();
        wifi.is_factory = false;
        let verdict = check_system(&cfg, &[art_info(), wifi]);
        assert!(verdict.primary_boot_image_ok());
        assert!(!verdict.mainline_extension_ok());
        assert!(!verdict.system_server_ok());
    }

    #[test]
    fn missing_runtime_module_is_unknown() {
        let cfg = test_config(Path::new("/r"));
        assert_eq!(check_system(&cfg, &[wifi_module()]).trigger(), Trigger::Unknown);
    }

    #[test]
    fn no_manifest_means_first_run() {
        let cfg = test_config(Path::new("/r"));
        assert_eq!(check_data(&cfg, &[art_info()], None), TrustVerdict::none_ok(Trigger::Unknown));
    }

    #[test]
    fn matching_manifest_is_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        populate(&cfg);
        let modules = vec![art_info(), wifi_module()];
        let manifest = CacheManifest::current(&cfg, &modules).unwrap();
        assert!(check_data(&cfg, &modules, Some(&manifest)).is_all_ok());
    }

    #[test]
    fn property_drift_is_a_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        populate(&cfg);
        let modules = vec![art_info()];
        let manifest = CacheManifest::current(&cfg, &modules).unwrap();
        cfg.system_properties.insert("dalvik.vm.usejit".into(), "false".into());
        let verdict = check_data(&cfg, &modules, Some(&manifest));
        assert_eq!(verdict, TrustVerdict::none_ok(Trigger::ModuleVersionMismatch));
    }

    #[test]
    fn reinstalled_runtime_module_is_detected_by_update_time() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        populate(&cfg);
        let manifest = CacheManifest::current(&cfg, &[art_info()]).unwrap();
        let mut art = art_info();
        art.last_update_millis = Some(1_700_000_000_000);
        let verdict = check_data(&cfg, &[art], Some(&manifest));
        assert_eq!(verdict.trigger(), Trigger::ModuleVersionMismatch);
        assert!(!verdict.primary_boot_image_ok());
    }

    #[test]
    fn changed_core_jar_revokes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        populate(&cfg);
        let modules = vec![art_info()];
        let manifest = CacheManifest::current(&cfg, &modules).unwrap();
        write_jar(&cfg.resolve(&cfg.dex2oat_boot_classpath[1]), &[b"changed framework"]);
        let verdict = check_data(&cfg, &modules, Some(&manifest));
        assert_eq!(verdict, TrustVerdict::none_ok(Trigger::InputFilesChanged));
    }

    #[test]
    fn updated_module_revokes_extension_and_system_server() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        populate(&cfg);
        let manifest = CacheManifest::current(&cfg, &[art_info(), wifi_module()]).unwrap();
        let mut wifi = wifi_module();
        wifi.version_code = 8;
        let verdict = check_data(&cfg, &[art_info(), wifi], Some(&manifest));
        assert_eq!(
            verdict,
            TrustVerdict::mainline_extension_not_ok(Trigger::ModuleVersionMismatch)
        );
    }

    #[test]
    fn changed_mainline_jar_keeps_primary_image() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        populate(&cfg);
        let modules = vec![art_info()];
        let manifest = CacheManifest::current(&cfg, &modules).unwrap();
        write_jar(&cfg.resolve(&cfg.boot_classpath[2]), &[b"new wifi"]);
        let verdict = check_data(&cfg, &modules, Some(&manifest));
        assert_eq!(verdict, TrustVerdict::mainline_extension_not_ok(Trigger::InputFilesChanged));
    }

    #[test]
    fn changed_system_server_jar_revokes_only_that_jar() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        populate(&cfg);
        let modules = vec![art_info()];
        let manifest = CacheManifest::current(&cfg, &modules).unwrap();
        let services = &cfg.system_server_classpath[0];
        write_jar(&cfg.resolve(services), &[b"services v2", b"more"]);

        let verdict = check_data(&cfg, &modules, Some(&manifest));

        assert!(verdict.mainline_extension_ok());
        assert!(!verdict.is_all_ok());
        assert!(!verdict.system_server_jar_ok(services));
        assert!(verdict.system_server_jar_ok(&cfg.system_server_classpath[1]));
        assert_eq!(verdict.trigger(), Trigger::InputFilesChanged);
    }

    #[test]
    fn moving_a_jar_off_the_classpath_revokes_all_system_server_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        populate(&cfg);
        let modules = vec![art_info()];
        let manifest = CacheManifest::current(&cfg, &modules).unwrap();
        let moved = cfg.system_server_classpath.pop().unwrap();
        cfg.standalone_system_server_jars.insert(0, moved);

        let verdict = check_data(&cfg, &modules, Some(&manifest));

        assert_eq!(verdict, TrustVerdict::system_server_not_ok(Trigger::InputFilesChanged));
    }

    #[test]
    fn first_mismatch_decides_when_several_apply() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        populate(&cfg);
        let manifest = CacheManifest::current(&cfg, &[art_info(), wifi_module()]).unwrap();
        let mut wifi = wifi_module();
        wifi.version_code = 8;
        write_jar(&cfg.resolve(&cfg.system_server_classpath[0]), &[b"services v2"]);

        let verdict = check_data(&cfg, &[art_info(), wifi.clone()], Some(&manifest));
        assert_eq!(
            verdict,
            TrustVerdict::mainline_extension_not_ok(Trigger::ModuleVersionMismatch)
        );

        write_jar(&cfg.resolve(&cfg.dex2oat_boot_classpath[1]), &[b"changed framework"]);
        cfg.system_properties.insert("dalvik.vm.usejit".into(), "false".into());
        let verdict = check_data(&cfg, &[art_info(), wifi], Some(&manifest));
        assert_eq!(verdict, TrustVerdict::none_ok(Trigger::ModuleVersionMismatch));
    }

    #[test]
    fn extension_is_never_trusted_without_primary() {
        let verdict = TrustVerdict {
            primary_boot_image: false,
            ..TrustVerdict::all_ok()
        };
        assert!(!verdict.mainline_extension_ok());
    }
}
