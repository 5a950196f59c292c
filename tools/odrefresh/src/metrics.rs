//! Run metrics, written once when the process exits.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::ExecResult;
use crate::error::{IoContext, OdrError};
use crate::fsutil;

/// Metrics record format version.
pub const METRICS_VERSION: u32 = 4;

/// Why compilation was needed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// No specific cause, e.g. no prior manifest.
    #[default]
    Unknown,
    /// A module, a tracked property or the GC mode changed.
    ModuleVersionMismatch,
    /// An input jar's fingerprint changed.
    InputFilesChanged,
    /// Artifacts are missing from disk.
    MissingArtifacts,
}

/// How far a run got.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing recorded yet.
    #[default]
    Unknown,
    /// Evaluating preconditions.
    Check,
    /// Writing the manifest and setting up staging.
    Preparation,
    /// Boot images for the first instruction set.
    PrimaryBootClasspath,
    /// Boot images for the second instruction set.
    SecondaryBootClasspath,
    /// System server jars.
    SystemServerClasspath,
    /// All units succeeded.
    Complete,
}

/// Outcome of the run, or of the first failing unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No failure.
    Ok,
    /// Catch-all for unexpected states.
    #[default]
    Unknown,
    /// Pre-flight space check failed.
    NoSpace,
    /// A filesystem operation failed.
    IoError,
    /// The compiler failed.
    CompilerError,
    /// The compiler ran past its deadline.
    TimedOut,
    /// No staging area could be set up.
    StagingFailed,
}

/// Which boot images a stage compiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BcpCompilationType {
    /// Primary image only (no updatable tail).
    Primary,
    /// Primary image and mainline extension.
    PrimaryAndMainline,
    /// Mainline extension only.
    MainlineOnly,
}

/// Timing and compiler result of one stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Wall time spent in the stage.
    pub elapsed_millis: u64,
    /// Result of the last compiler invocation of the stage.
    pub exec: ExecResult,
    /// Boot images compiled, for boot classpath stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compilation_type: Option<BcpCompilationType>,
}

/// The on-disk metrics record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Record format version.
    pub version: u32,
    /// Runtime module version code, if known.
    pub art_apex_version: Option<i64>,
    /// First trigger observed.
    pub trigger: Trigger,
    /// Stage reached, or where the first failure happened.
    pub stage_reached: Stage,
    /// Final status.
    pub status: Status,
    /// Free cache space at start, in MiB.
    pub cache_space_free_start_mib: Option<u64>,
    /// Free cache space at exit, in MiB.
    pub cache_space_free_end_mib: Option<u64>,
    /// First boot classpath stage.
    pub primary_bcp: Option<StageRecord>,
    /// Second boot classpath stage.
    pub secondary_bcp: Option<StageRecord>,
    /// System server stage.
    pub system_server: Option<StageRecord>,
}

/// Mutable metrics collected during a run.
#[derive(Debug, Default)]
pub struct OdrMetrics {
    art_apex_version: Option<i64>,
    trigger: Option<Trigger>,
    stage: Stage,
    status: Status,
    cache_space_free_start_mib: Option<u64>,
    cache_space_free_end_mib: Option<u64>,
    primary_bcp: Option<StageRecord>,
    secondary_bcp: Option<StageRecord>,
    system_server: Option<StageRecord>,
}

impl OdrMetrics {
    /// Record the trigger unless one was already recorded.
    pub fn set_trigger(&mut self, trigger: Trigger) {
        self.trigger.get_or_insert(trigger);
    }

    /// The first trigger recorded, if any.
    pub fn trigger(&self) -> Option<Trigger> {
        self.trigger
    }

    /// Record the stage reached.
    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// Stage reached so far.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Record the run status.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Record the runtime module version.
    pub fn set_art_apex_version(&mut self, version: i64) {
        self.art_apex_version = Some(version);
    }

    fn stage_record(&mut self, stage: Stage) -> Option<&mut StageRecord> {
        let slot = match stage {
            Stage::PrimaryBootClasspath => &mut self.primary_bcp,
            Stage::SecondaryBootClasspath => &mut self.secondary_bcp,
            Stage::SystemServerClasspath => &mut self.system_server,
            _ => return None,
        };
        Some(slot.get_or_insert_with(StageRecord::default))
    }

    /// Record the elapsed time and last compiler result of a stage.
    pub fn set_compiler_result(&mut self, stage: Stage, elapsed: Duration, exec: ExecResult) {
        if let Some(rec) = self.stage_record(stage) {
            rec.elapsed_millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            rec.exec = exec;
        }
    }

    /// Record which boot images a boot classpath stage compiled.
    pub fn set_bcp_compilation_type(&mut self, stage: Stage, ty: BcpCompilationType) {
        if let Some(rec) = self.stage_record(stage) {
            rec.compilation_type = Some(ty);
        }
    }

    /// Recorded data for `stage`.
    pub fn stage_result(&self, stage: Stage) -> Option<&StageRecord> {
        match stage {
            Stage::PrimaryBootClasspath => self.primary_bcp.as_ref(),
            Stage::SecondaryBootClasspath => self.secondary_bcp.as_ref(),
            Stage::SystemServerClasspath => self.system_server.as_ref(),
            _ => None,
        }
    }

    /// Sample free space in `dir` as the starting figure.
    pub fn capture_space_free_start(&mut self, dir: &Path) {
        self.cache_space_free_start_mib = free_mib(dir);
    }

    /// Sample free space in `dir` as the final figure.
    pub fn capture_space_free_end(&mut self, dir: &Path) {
        self.cache_space_free_end_mib = free_mib(dir);
    }

    /// Snapshot the collected values.
    pub fn record(&self) -> MetricsRecord {
        MetricsRecord {
            version: METRICS_VERSION,
            art_apex_version: self.art_apex_version,
            trigger: self.trigger.unwrap_or_default(),
            stage_reached: self.stage,
            status: self.status,
            cache_space_free_start_mib: self.cache_space_free_start_mib,
            cache_space_free_end_mib: self.cache_space_free_end_mib,
            primary_bcp: self.primary_bcp.clone(),
            secondary_bcp: self.secondary_bcp.clone(),
            system_server: self.system_server.clone(),
        }
    }

    /// Write the record to `path` atomically.
    pub fn write(&self, path: &Path) -> Result<(), OdrError> {
        let json = serde_json::to_string_pretty(&self.record())
            .map_err(|e| OdrError::Unknown(format!("failed to serialize metrics: {e}")))?;
        if let Some(dir) = path.parent() {
            fsutil::ensure_dir(dir)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).io_context("failed to write", &tmp)?;
        fs::rename(&tmp, path).io_context("failed to replace", path)
    }
}

/// Free space in MiB, walking up to the nearest existing ancestor.
fn free_mib(dir: &Path) -> Option<u64> {
    let existing = dir.ancestors().find(|p| p.exists())?;
    match fsutil::free_space(existing) {
        Ok(bytes) => Some(bytes / (1024 * 1024)),
        Err(e) => {
            warn!("failed to query free space of {}: {e}", existing.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecStatus;

    #[test]
    fn first_trigger_wins() {
        let mut m = OdrMetrics::default();
        assert_eq!(m.trigger(), None);
        m.set_trigger(Trigger::InputFilesChanged);
        m.set_trigger(Trigger::MissingArtifacts);
        assert_eq!(m.trigger(), Some(Trigger::InputFilesChanged));
    }

    #[test]
    fn unset_trigger_is_recorded_as_unknown() {
        assert_eq!(OdrMetrics::default().record().trigger, Trigger::Unknown);
    }

    #[test]
    fn stage_results_are_kept_per_stage() {
        let mut m = OdrMetrics::default();
        let exec = ExecResult {
            status: ExecStatus::Exited,
            exit_code: 0,
            signal: 0,
        };
        m.set_compiler_result(Stage::SecondaryBootClasspath, Duration::from_millis(1500), exec);
        m.set_bcp_compilation_type(Stage::SecondaryBootClasspath, BcpCompilationType::MainlineOnly);
        m.set_compiler_result(Stage::Complete, Duration::from_secs(1), exec);

        let rec = m.stage_result(Stage::SecondaryBootClasspath).unwrap();
        assert_eq!(rec.elapsed_millis, 1500);
        assert_eq!(rec.compilation_type, Some(BcpCompilationType::MainlineOnly));
        assert!(m.stage_result(Stage::PrimaryBootClasspath).is_none());
    }

    #[test]
    fn record_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics/odrefresh-metrics.json");
        let mut m = OdrMetrics::default();
        m.set_art_apex_version(7);
        m.set_stage(Stage::Complete);
        m.set_status(Status::Ok);
        m.capture_space_free_start(dir.path());
        m.write(&path).unwrap();

        let back: MetricsRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.version, METRICS_VERSION);
        assert_eq!(back.stage_reached, Stage::Complete);
        assert_eq!(back.status, Status::Ok);
        assert_eq!(back.art_apex_version, Some(7));
        assert!(back.cache_space_free_start_mib.is_some());
    }
}
