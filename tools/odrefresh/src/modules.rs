//! Installed module metadata.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ART_MODULE_NAME;

/// Version information for one installed module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    /// Module name, e.g. `com.android.art`.
    #[serde(alias = "moduleName")]
    pub name: String,
    /// Monotonic version code.
    pub version_code: i64,
    /// Human-readable version.
    #[serde(default)]
    pub version_name: String,
    /// Install time of an update, absent for factory modules on some builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_millis: Option<i64>,
    /// Unmodified since the device was built.
    #[serde(default)]
    pub is_factory: bool,
    /// The version currently mounted.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ModuleInfo {
    /// Returns `true` if version code, name and update time all match.
    ///
    /// The update time catches a reinstall of the same version.
    pub fn same_version(&self, other: &Self) -> bool {
        self.version_code == other.version_code
            && self.version_name == other.version_name
            && self.last_update_millis == other.last_update_millis
    }
}

/// Source of installed module metadata.
pub trait ModuleInfoSource {
    /// All installed modules, active and inactive.
    fn modules(&self) -> Result<Vec<ModuleInfo>>;
}

/// Reads the JSON module list the package manager publishes.
pub struct ApexInfoListFile {
    path: PathBuf,
}

impl ApexInfoListFile {
    /// Reader for the list at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ModuleInfoSource for ApexInfoListFile {
    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read module list {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse module list {}", self.path.display()))
    }
}

/// An in-memory module list.
impl ModuleInfoSource for Vec<ModuleInfo> {
    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        Ok(self.clone())
    }
}

/// Active modules only, in source order.
pub fn active(modules: &[ModuleInfo]) -> Vec<ModuleInfo> {
    modules.iter().filter(|m| m.is_active).cloned().collect()
}

/// The active runtime module, if installed.
pub fn art_module(modules: &[ModuleInfo]) -> Option<&ModuleInfo> {
    modules.iter().find(|m| m.is_active && m.name == ART_MODULE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_file_accepts_package_manager_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apex-info-list.json");
        fs::write(
            &path,
            r#"[
                {"moduleName": "com.android.art", "versionCode": 3, "versionName": "3",
                 "isFactory": true, "isActive": true},
                {"moduleName": "com.android.wifi", "versionCode": 7,
                 "lastUpdateMillis": 1234, "isFactory": false, "isActive": false}
            ]"#,
        )
        .unwrap();

        let modules = ApexInfoListFile::new(&path).modules().unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].last_update_millis, None);
        assert_eq!(modules[1].last_update_millis, Some(1234));
        assert_eq!(active(&modules).len(), 1);
        assert_eq!(art_module(&modules).unwrap().version_code, 3);
    }

    #[test]
    fn reinstall_with_same_version_is_a_change() {
        let a = ModuleInfo {
            name: "m".into(),
            version_code: 1,
            version_name: "1".into(),
            last_update_millis: Some(10),
            is_factory: false,
            is_active: true,
        };
        let b = ModuleInfo { last_update_millis: Some(20), ..a.clone() };
        assert!(a.same_version(&a));
        assert!(!a.same_version(&b));
    }

    #[test]
    fn missing_list_is_an_error() {
        assert!(ApexInfoListFile::new("/nonexistent/apex-info-list.json").modules().is_err());
    }
}
