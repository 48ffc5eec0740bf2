//! Job identity, lifecycle states, and record types.
//!
//! Follows a config/state split: `JobSpec` is immutable after submission,
//! `JobState` mutates as the pipeline advances.

use crate::boot::DistroFamily;
use crate::disk::FilesystemKind;
use crate::errors::ErrorDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique conversion job identifier (UUIDv4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pipeline stage a job is currently in.
///
/// Stages advance strictly in declaration order; `Pending` is the
/// pre-pipeline state and `Finalizing` the last stage before a terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Exporting,
    Allocating,
    Partitioning,
    Formatting,
    Mounting,
    Populating,
    InstallingKernel,
    InstallingBootloader,
    Finalizing,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Exporting => "exporting",
            JobStage::Allocating => "allocating",
            JobStage::Partitioning => "partitioning",
            JobStage::Formatting => "formatting",
            JobStage::Mounting => "mounting",
            JobStage::Populating => "populating",
            JobStage::InstallingKernel => "installing_kernel",
            JobStage::InstallingBootloader => "installing_bootloader",
            JobStage::Finalizing => "finalizing",
        }
    }
}

/// Coarse job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Fixed job parameters captured at submission.
#[derive(Debug, Clone)]
pub(crate) struct JobSpec {
    pub source_ref: String,
    pub output_path: PathBuf,
    pub size_mb: u64,
    pub filesystem: FilesystemKind,
    pub overwrite: bool,
}

/// Live resources tied to the mounted build window.
///
/// Invariant: empty whenever the job status is terminal. The manager
/// enforces this on every terminal transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResourceHandles {
    pub loop_device: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
}

impl ResourceHandles {
    pub fn is_empty(&self) -> bool {
        self.loop_device.is_none() && self.mount_point.is_none()
    }

    pub fn clear(&mut self) {
        self.loop_device = None;
        self.mount_point = None;
    }
}

/// Mutable job state.
#[derive(Debug, Clone)]
pub(crate) struct JobState {
    pub stage: JobStage,
    pub status: JobStatus,
    pub error: Option<ErrorDetail>,
    pub distro: Option<DistroFamily>,
    pub warnings: Vec<String>,
    pub resources: ResourceHandles,
    pub created_at: DateTime<Utc>,
    pub stage_entered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            stage: JobStage::Pending,
            status: JobStatus::Pending,
            error: None,
            distro: None,
            warnings: Vec::new(),
            resources: ResourceHandles::default(),
            created_at: now,
            stage_entered_at: now,
            completed_at: None,
        }
    }
}

/// Read-only view of a job, returned by `status()` and `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub source_ref: String,
    pub output_path: PathBuf,
    pub stage: JobStage,
    pub status: JobStatus,
    pub distro: Option<DistroFamily>,
    pub error: Option<ErrorDetail>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_resource_handles_empty_tracking() {
        let mut handles = ResourceHandles::default();
        assert!(handles.is_empty());

        handles.loop_device = Some(PathBuf::from("/dev/loop0"));
        assert!(!handles.is_empty());

        handles.clear();
        assert!(handles.is_empty());
    }
}
