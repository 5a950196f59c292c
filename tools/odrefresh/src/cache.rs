//! Cache manifest recording what the cached artifacts were built from.
//!
//! Holds the property snapshot, module versions and input fingerprints of the
//! last compilation attempt. It is rewritten before every attempt, so after a
//! crash it still describes the inputs the cache was being built from.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::component::{self, Component, SystemServerComponent};
use crate::config::OdrConfig;
use crate::error::{IoContext, OdrError};
use crate::modules::{self, ModuleInfo};
use crate::props::PropertySnapshot;

/// Current schema version. Bump when the manifest format changes.
pub const MANIFEST_VERSION: u32 = 1;

/// Top-level manifest written into the artifact directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    /// Schema version; any other value reads as no manifest.
    pub version: u32,
    /// Tracked properties at compile time.
    pub system_properties: PropertySnapshot,
    /// The runtime module the artifacts were built against.
    pub art_module_info: ModuleInfo,
    /// Every active module at compile time.
    pub module_infos: Vec<ModuleInfo>,
    /// Full boot classpath fingerprints.
    pub boot_classpath: Vec<Component>,
    /// Compilable boot classpath fingerprints.
    pub dex2oat_boot_classpath: Vec<Component>,
    /// System server jar fingerprints.
    pub system_server_components: Vec<SystemServerComponent>,
    /// Artifacts were produced inside the isolated compilation VM.
    #[serde(default)]
    pub compilation_os_mode: bool,
}

impl CacheManifest {
    /// Describe the current inputs.
    ///
    /// # Errors
    ///
    /// Fails if the runtime module is not installed or any input jar cannot be
    /// fingerprinted.
    pub fn current(config: &OdrConfig, modules: &[ModuleInfo]) -> Result<Self, OdrError> {
        let art = modules::art_module(modules)
            .ok_or_else(|| OdrError::Unknown("runtime module is not installed".into()))?;

        Ok(Self {
            version: MANIFEST_VERSION,
            system_properties: config.system_properties.clone(),
            art_module_info: art.clone(),
            module_infos: modules::active(modules),
            boot_classpath: component::fingerprint_all(config, &config.boot_classpath)?,
            dex2oat_boot_classpath: component::fingerprint_all(
                config,
                &config.dex2oat_boot_classpath,
            )?,
            system_server_components: component::fingerprint_system_server(config)?,
            compilation_os_mode: matches!(
                config.backend,
                crate::config::BackendKind::Remote { .. }
            ),
        })
    }

    /// Load the manifest at `path`.
    ///
    /// Returns `None` if the file is missing, corrupt, or has a version mismatch.
    pub fn load(path: &Path) -> Option<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no prior cache manifest at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("failed to read cache manifest {}: {e}", path.display());
                return None;
            }
        };
        let manifest: Self = match serde_json::from_str(&data) {
            Ok(m) => m,
            Err(e) => {
                warn!("ignoring corrupt cache manifest {}: {e}", path.display());
                return None;
            }
        };
        if manifest.version != MANIFEST_VERSION {
            info!(
                "ignoring cache manifest version {} (expected {MANIFEST_VERSION})",
                manifest.version
            );
            return None;
        }
        Some(manifest)
    }

    /// Serialise to the on-disk form.
    pub fn to_json(&self) -> Result<String, OdrError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| OdrError::Unknown(format!("failed to serialize cache manifest: {e}")))
    }

    /// Save the manifest atomically (write to tmp, then rename).
    ///
    /// Returns the SHA-256 of the written bytes.
    pub fn save(&self, path: &Path) -> Result<String, OdrError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).io_context("failed to create", dir)?;
        }
        let tmp_path = path.with_extension("json.tmp");

        let json = self.to_json()?;
        fs::write(&tmp_path, &json).io_context("failed to write", &tmp_path)?;
        fs::rename(&tmp_path, path).io_context("failed to replace", path)?;

        Ok(hash_bytes(json.as_bytes()))
    }
}

/// Compute the SHA-256 hash of a byte slice, returned as a hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
