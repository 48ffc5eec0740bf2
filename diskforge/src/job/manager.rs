//! Thread-safe job registry.
//!
//! Tracks every submitted conversion and owns two invariants:
//! - at most one non-terminal job per output path,
//! - resource handles are cleared by the time a job reaches a terminal
//!   status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::errors::{DiskforgeError, DiskforgeResult, ErrorDetail};
use crate::job::types::{JobId, JobSnapshot, JobSpec, JobStage, JobState, JobStatus, ResourceHandles};

struct JobEntry {
    spec: JobSpec,
    state: JobState,
    cancel: Arc<AtomicBool>,
}

struct JobManagerInner {
    jobs: HashMap<JobId, JobEntry>,
    /// Output paths owned by non-terminal jobs.
    active_outputs: HashMap<std::path::PathBuf, JobId>,
}

/// Registry of all jobs this runtime has seen.
///
/// Cloneable via `Arc`; RwLock allows concurrent status reads while a job
/// transitions.
#[derive(Clone)]
pub(crate) struct JobManager {
    inner: Arc<RwLock<JobManagerInner>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager").finish()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(JobManagerInner {
                jobs: HashMap::new(),
                active_outputs: HashMap::new(),
            })),
        }
    }

    fn write(&self) -> DiskforgeResult<RwLockWriteGuard<'_, JobManagerInner>> {
        self.inner
            .write()
            .map_err(|e| DiskforgeError::Internal(format!("job registry lock poisoned: {}", e)))
    }

    fn read(&self) -> DiskforgeResult<RwLockReadGuard<'_, JobManagerInner>> {
        self.inner
            .read()
            .map_err(|e| DiskforgeError::Internal(format!("job registry lock poisoned: {}", e)))
    }

    /// Register a new job, claiming its output path.
    ///
    /// # Errors
    ///
    /// `Conflict` if another non-terminal job owns the same output path.
    pub fn register(&self, id: JobId, spec: JobSpec) -> DiskforgeResult<Arc<AtomicBool>> {
        let mut inner = self.write()?;

        if inner.jobs.contains_key(&id) {
            return Err(DiskforgeError::Internal(format!(
                "job {} already registered",
                id
            )));
        }

        if let Some(owner) = inner.active_outputs.get(&spec.output_path) {
            return Err(DiskforgeError::Conflict(format!(
                "output {} is already claimed by running job {}",
                spec.output_path.display(),
                owner
            )));
        }

        tracing::debug!(
            job_id = %id,
            source_ref = %spec.source_ref,
            output = %spec.output_path.display(),
            "registering job"
        );

        let cancel = Arc::new(AtomicBool::new(false));
        inner.active_outputs.insert(spec.output_path.clone(), id.clone());
        inner.jobs.insert(
            id,
            JobEntry {
                spec,
                state: JobState::new(),
                cancel: Arc::clone(&cancel),
            },
        );
        Ok(cancel)
    }

    /// Advance a job to the given stage, marking it Running.
    pub fn enter_stage(&self, id: &JobId, stage: JobStage) -> DiskforgeResult<()> {
        let mut inner = self.write()?;
        let entry = entry_mut(&mut inner, id)?;

        if entry.state.status.is_terminal() {
            return Err(DiskforgeError::InvalidState(format!(
                "job {} is already {:?}",
                id, entry.state.status
            )));
        }

        tracing::debug!(
            job_id = %id,
            from = entry.state.stage.as_str(),
            to = stage.as_str(),
            "entering stage"
        );
        entry.state.stage = stage;
        entry.state.status = JobStatus::Running;
        entry.state.stage_entered_at = Utc::now();
        Ok(())
    }

    pub fn set_distro(&self, id: &JobId, family: crate::boot::DistroFamily) -> DiskforgeResult<()> {
        let mut inner = self.write()?;
        entry_mut(&mut inner, id)?.state.distro = Some(family);
        Ok(())
    }

    /// Attach a warning that will be surfaced in the final result message.
    pub fn push_warning(&self, id: &JobId, warning: String) -> DiskforgeResult<()> {
        let mut inner = self.write()?;
        let entry = entry_mut(&mut inner, id)?;
        tracing::warn!(job_id = %id, "{}", warning);
        entry.state.warnings.push(warning);
        Ok(())
    }

    /// Mutate the live resource handles for a job.
    pub fn update_resources(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut ResourceHandles),
    ) -> DiskforgeResult<()> {
        let mut inner = self.write()?;
        f(&mut entry_mut(&mut inner, id)?.state.resources);
        Ok(())
    }

    /// Request cooperative cancellation.
    ///
    /// Returns true if the job was still running and the flag was raised,
    /// false if it had already reached a terminal status.
    pub fn cancel(&self, id: &JobId) -> DiskforgeResult<bool> {
        let inner = self.read()?;
        let entry = inner
            .jobs
            .get(id)
            .ok_or_else(|| DiskforgeError::NotFound(format!("job {}", id)))?;

        if entry.state.status.is_terminal() {
            return Ok(false);
        }
        entry.cancel.store(true, Ordering::SeqCst);
        tracing::info!(job_id = %id, "cancellation requested");
        Ok(true)
    }

    /// Move a job to a terminal status and release its output claim.
    ///
    /// Clears any resource handles still recorded, loudly: by this point
    /// the rollback path must already have released the real resources.
    pub fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<ErrorDetail>,
    ) -> DiskforgeResult<()> {
        debug_assert!(status.is_terminal());
        let mut inner = self.write()?;

        let output = {
            let entry = entry_mut(&mut inner, id)?;
            if !entry.state.resources.is_empty() {
                tracing::warn!(
                    job_id = %id,
                    loop_device = ?entry.state.resources.loop_device,
                    mount_point = ?entry.state.resources.mount_point,
                    "terminal transition with live resource handles, clearing"
                );
                entry.state.resources.clear();
            }

            tracing::info!(job_id = %id, status = ?status, "job finished");
            entry.state.status = status;
            entry.state.error = error;
            entry.state.completed_at = Some(Utc::now());
            entry.spec.output_path.clone()
        };

        if inner.active_outputs.get(&output) == Some(id) {
            inner.active_outputs.remove(&output);
        }
        Ok(())
    }

    pub fn snapshot(&self, id: &JobId) -> DiskforgeResult<Option<JobSnapshot>> {
        let inner = self.read()?;
        Ok(inner.jobs.get(id).map(|entry| snapshot_of(id, entry)))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> DiskforgeResult<Vec<JobSnapshot>> {
        let inner = self.read()?;
        let mut snapshots: Vec<JobSnapshot> = inner
            .jobs
            .iter()
            .map(|(id, entry)| snapshot_of(id, entry))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Cancellation flags of every non-terminal job.
    pub fn active_cancel_flags(&self) -> DiskforgeResult<Vec<(JobId, Arc<AtomicBool>)>> {
        let inner = self.read()?;
        Ok(inner
            .jobs
            .iter()
            .filter(|(_, entry)| !entry.state.status.is_terminal())
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.cancel)))
            .collect())
    }

    #[cfg(test)]
    pub fn resources(&self, id: &JobId) -> DiskforgeResult<ResourceHandles> {
        let inner = self.read()?;
        Ok(inner
            .jobs
            .get(id)
            .map(|entry| entry.state.resources.clone())
            .unwrap_or_default())
    }
}

fn entry_mut<'a>(
    inner: &'a mut JobManagerInner,
    id: &JobId,
) -> DiskforgeResult<&'a mut JobEntry> {
    inner
        .jobs
        .get_mut(id)
        .ok_or_else(|| DiskforgeError::Internal(format!("job {} not found", id)))
}

fn snapshot_of(id: &JobId, entry: &JobEntry) -> JobSnapshot {
    JobSnapshot {
        id: id.clone(),
        source_ref: entry.spec.source_ref.clone(),
        output_path: entry.spec.output_path.clone(),
        stage: entry.state.stage,
        status: entry.state.status,
        distro: entry.state.distro,
        error: entry.state.error.clone(),
        warnings: entry.state.warnings.clone(),
        created_at: entry.state.created_at,
        completed_at: entry.state.completed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FilesystemKind;
    use std::path::PathBuf;

    fn test_spec(output: &str) -> JobSpec {
        JobSpec {
            source_ref: "alpine:latest".to_string(),
            output_path: PathBuf::from(output),
            size_mb: 1024,
            filesystem: FilesystemKind::Ext4,
            overwrite: false,
        }
    }

    #[test]
    fn test_register_and_snapshot() {
        let manager = JobManager::new();
        let id = JobId::new();
        manager.register(id.clone(), test_spec("/tmp/a.img")).unwrap();

        let snap = manager.snapshot(&id).unwrap().unwrap();
        assert_eq!(snap.status, JobStatus::Pending);
        assert_eq!(snap.stage, JobStage::Pending);
        assert_eq!(snap.output_path, PathBuf::from("/tmp/a.img"));
    }

    #[test]
    fn test_duplicate_output_conflicts() {
        let manager = JobManager::new();
        manager
            .register(JobId::new(), test_spec("/tmp/same.img"))
            .unwrap();

        let err = manager
            .register(JobId::new(), test_spec("/tmp/same.img"))
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::Conflict(_)));

        // A different output path is fine.
        manager
            .register(JobId::new(), test_spec("/tmp/other.img"))
            .unwrap();
    }

    #[test]
    fn test_output_claim_released_on_finish() {
        let manager = JobManager::new();
        let id = JobId::new();
        manager.register(id.clone(), test_spec("/tmp/b.img")).unwrap();
        manager.finish(&id, JobStatus::Failed, None).unwrap();

        // The path can now be claimed again.
        manager.register(JobId::new(), test_spec("/tmp/b.img")).unwrap();
    }

    #[test]
    fn test_enter_stage_marks_running() {
        let manager = JobManager::new();
        let id = JobId::new();
        manager.register(id.clone(), test_spec("/tmp/c.img")).unwrap();

        manager.enter_stage(&id, JobStage::Exporting).unwrap();
        let snap = manager.snapshot(&id).unwrap().unwrap();
        assert_eq!(snap.status, JobStatus::Running);
        assert_eq!(snap.stage, JobStage::Exporting);
    }

    #[test]
    fn test_enter_stage_after_terminal_rejected() {
        let manager = JobManager::new();
        let id = JobId::new();
        manager.register(id.clone(), test_spec("/tmp/d.img")).unwrap();
        manager.finish(&id, JobStatus::Cancelled, None).unwrap();

        let err = manager.enter_stage(&id, JobStage::Allocating).unwrap_err();
        assert!(matches!(err, DiskforgeError::InvalidState(_)));
    }

    #[test]
    fn test_finish_clears_resource_handles() {
        let manager = JobManager::new();
        let id = JobId::new();
        manager.register(id.clone(), test_spec("/tmp/e.img")).unwrap();
        manager
            .update_resources(&id, |r| {
                r.loop_device = Some(PathBuf::from("/dev/loop7"));
                r.mount_point = Some(PathBuf::from("/mnt/x"));
            })
            .unwrap();

        manager.finish(&id, JobStatus::Succeeded, None).unwrap();
        assert!(manager.resources(&id).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_sets_shared_flag() {
        let manager = JobManager::new();
        let id = JobId::new();
        let flag = manager.register(id.clone(), test_spec("/tmp/f.img")).unwrap();

        assert!(manager.cancel(&id).unwrap());
        assert!(flag.load(Ordering::SeqCst));

        // Cancelling a finished job reports false.
        manager.finish(&id, JobStatus::Cancelled, None).unwrap();
        assert!(!manager.cancel(&id).unwrap());
    }

    #[test]
    fn test_cancel_unknown_job() {
        let manager = JobManager::new();
        let err = manager.cancel(&JobId::new()).unwrap_err();
        assert!(matches!(err, DiskforgeError::NotFound(_)));
    }

    #[test]
    fn test_list_newest_first() {
        let manager = JobManager::new();
        let first = JobId::new();
        manager.register(first.clone(), test_spec("/tmp/g.img")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = JobId::new();
        manager.register(second.clone(), test_spec("/tmp/h.img")).unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[1].id, first);
    }

    #[test]
    fn test_warnings_accumulate() {
        let manager = JobManager::new();
        let id = JobId::new();
        manager.register(id.clone(), test_spec("/tmp/i.img")).unwrap();
        manager
            .push_warning(&id, "kernel install skipped".to_string())
            .unwrap();

        let snap = manager.snapshot(&id).unwrap().unwrap();
        assert_eq!(snap.warnings, vec!["kernel install skipped".to_string()]);
    }
}
