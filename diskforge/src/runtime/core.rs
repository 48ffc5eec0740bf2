//! High-level converter runtime structures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::artifacts::{self, ArtifactEntry};
use crate::convert::{self, ConversionResult, ConvertRequest, DEFAULT_OUTPUT_FILENAME};
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::init_logging_for;
use crate::job::{JobId, JobManager, JobSnapshot, JobSpec};
use crate::loopdev::LoopPool;
use crate::preflight;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::RuntimeOptions;
use crate::source::{LocalSource, SourceProvider};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Converter is the main entry point for turning container filesystems
/// into bootable disk images.
///
/// **Cloning**: cheaply cloneable via `Arc` - all clones share the same
/// job registry, loop pool, and layout.
#[derive(Clone)]
pub struct Converter {
    inner: RuntimeInner,
}

/// Internal runtime state shared by all clones.
pub(crate) type RuntimeInner = Arc<RuntimeInnerImpl>;

/// Runtime inner implementation.
///
/// Immutable after construction apart from the internally synchronized
/// job registry and the join-handle table.
pub(crate) struct RuntimeInnerImpl {
    pub(crate) options: RuntimeOptions,
    pub(crate) layout: FilesystemLayout,
    /// Job registry (has internal RwLock).
    pub(crate) jobs: JobManager,
    /// Bounded loop device slots (internal semaphore).
    pub(crate) loop_pool: LoopPool,
    pub(crate) source: Arc<dyn SourceProvider>,
    /// Join handles of in-flight jobs, consumed by `wait`.
    handles: Mutex<HashMap<JobId, JoinHandle<ConversionResult>>>,
}

impl Converter {
    /// Create a converter with the built-in filesystem source provider.
    ///
    /// **Prepare Before Execute**: layout and logging are set up before
    /// returning, so a constructed converter accepts jobs without further
    /// initialization.
    pub fn new(options: RuntimeOptions) -> DiskforgeResult<Self> {
        Self::with_source(options, Arc::new(LocalSource))
    }

    /// Create a converter with a custom source provider.
    pub fn with_source(
        options: RuntimeOptions,
        source: Arc<dyn SourceProvider>,
    ) -> DiskforgeResult<Self> {
        if !options.home_dir.is_absolute() {
            return Err(DiskforgeError::InvalidArgument(format!(
                "home_dir must be an absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            DiskforgeError::Internal(format!(
                "failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let loop_pool = LoopPool::new(options.loop_capacity, options.exhaust_policy);

        let inner = Arc::new(RuntimeInnerImpl {
            options,
            layout,
            jobs: JobManager::new(),
            loop_pool,
            source,
            handles: Mutex::new(HashMap::new()),
        });

        tracing::debug!("initialized converter runtime");
        Ok(Self { inner })
    }

    /// Equivalent to `Converter::new(RuntimeOptions::default())`.
    pub fn with_defaults() -> DiskforgeResult<Self> {
        Self::new(RuntimeOptions::default())
    }

    /// Validate a request, claim its output path, and start the pipeline
    /// in the background. Returns immediately with the job id.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty source ref or zero size
    /// - `NotFound` / `InvalidState` when the host fails preflight
    /// - `Conflict` when another running job owns the output path
    pub fn submit(&self, request: ConvertRequest) -> DiskforgeResult<JobId> {
        if request.source_ref.is_empty() {
            return Err(DiskforgeError::InvalidArgument(
                "source_ref is empty".to_string(),
            ));
        }
        // Same taxonomy as the allocator itself: a zero-size request is an
        // allocation failure, just caught before any resource exists.
        if request.size_mb == 0 {
            return Err(DiskforgeError::Allocation(
                "requested size is 0 MiB".to_string(),
            ));
        }

        preflight::check_host(request.filesystem, &self.inner.options.mbr_bin_path)?;

        let output_path = self.resolve_output(&request);
        let spec = JobSpec {
            source_ref: request.source_ref,
            output_path,
            size_mb: request.size_mb,
            filesystem: request.filesystem,
            overwrite: request.overwrite,
        };

        let job_id = JobId::new();
        let cancel = self.inner.jobs.register(job_id.clone(), spec.clone())?;

        tracing::info!(
            job_id = %job_id,
            source_ref = %spec.source_ref,
            output = %spec.output_path.display(),
            size_mb = spec.size_mb,
            "job submitted"
        );

        let runtime = Arc::clone(&self.inner);
        let handle = tokio::spawn(convert::run_job(runtime, job_id.clone(), spec, cancel));
        self.inner.handles.lock().insert(job_id.clone(), handle);
        Ok(job_id)
    }

    /// Run a conversion to completion.
    pub async fn convert(&self, request: ConvertRequest) -> DiskforgeResult<ConversionResult> {
        let job_id = self.submit(request)?;
        self.wait(&job_id).await
    }

    /// Wait for a submitted job and take its result.
    ///
    /// Each job's result can be taken once; afterwards `status` still
    /// serves the terminal snapshot.
    pub async fn wait(&self, id: &JobId) -> DiskforgeResult<ConversionResult> {
        let handle = self
            .inner
            .handles
            .lock()
            .remove(id)
            .ok_or_else(|| DiskforgeError::NotFound(format!("no in-flight job {}", id)))?;

        handle
            .await
            .map_err(|e| DiskforgeError::Internal(format!("job task panicked: {}", e)))
    }

    /// Point-in-time view of a job, running or finished.
    pub fn status(&self, id: &JobId) -> DiskforgeResult<Option<JobSnapshot>> {
        self.inner.jobs.snapshot(id)
    }

    /// All jobs this runtime has seen, newest first.
    pub fn list_jobs(&self) -> DiskforgeResult<Vec<JobSnapshot>> {
        self.inner.jobs.list()
    }

    /// Request cooperative cancellation.
    ///
    /// Takes effect at the next stage boundary; the job then rolls back
    /// and reports `Cancelled`. Returns false if the job had already
    /// finished.
    pub fn cancel(&self, id: &JobId) -> DiskforgeResult<bool> {
        self.inner.jobs.cancel(id)
    }

    /// Finished images in the runtime images directory.
    pub async fn list_artifacts(&self) -> DiskforgeResult<Vec<ArtifactEntry>> {
        artifacts::list_images(&self.inner.layout.images_dir()).await
    }

    /// Remove all finished images and manifests.
    ///
    /// # Errors
    ///
    /// `Conflict` while any job is still running; their artifacts live in
    /// the same directory.
    pub async fn cleanup_artifacts(&self) -> DiskforgeResult<u64> {
        let active = self.inner.jobs.active_cancel_flags()?;
        if !active.is_empty() {
            return Err(DiskforgeError::Conflict(format!(
                "{} jobs still running, wait or cancel before cleanup",
                active.len()
            )));
        }
        artifacts::cleanup_images(&self.inner.layout.images_dir()).await
    }

    /// Cancel every in-flight job and wait for the rollbacks to finish.
    pub async fn shutdown(&self) -> DiskforgeResult<()> {
        for (id, flag) in self.inner.jobs.active_cancel_flags()? {
            flag.store(true, Ordering::SeqCst);
            tracing::debug!(job_id = %id, "cancellation requested for shutdown");
        }

        let handles: Vec<JoinHandle<ConversionResult>> = {
            let mut map = self.inner.handles.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "job task panicked during shutdown");
            }
        }
        Ok(())
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn home_dir(&self) -> &Path {
        self.inner.layout.home_dir()
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl Converter {
    fn resolve_output(&self, request: &ConvertRequest) -> PathBuf {
        match &request.output {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.inner.layout.images_dir().join(path),
            None => self.inner.layout.images_dir().join(DEFAULT_OUTPUT_FILENAME),
        }
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("home_dir", &self.inner.layout.home_dir())
            .finish()
    }
}

impl std::fmt::Debug for RuntimeInnerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("home_dir", &self.layout.home_dir())
            .field("loop_pool", &self.loop_pool)
            .finish()
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

// Compile-time assertion that Converter stays Send + Sync; job tasks move
// clones of the inner state across threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Converter>;
};

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options(home: &Path) -> RuntimeOptions {
        RuntimeOptions {
            home_dir: home.to_path_buf(),
            ..RuntimeOptions::default()
        }
    }

    #[tokio::test]
    async fn test_new_prepares_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("forge");
        let converter = Converter::new(test_options(&home)).unwrap();

        assert!(home.join("images").is_dir());
        assert!(home.join("staging").is_dir());
        assert_eq!(converter.home_dir(), home.as_path());
    }

    #[test]
    fn test_relative_home_rejected() {
        let err = Converter::new(test_options(Path::new("relative/home"))).unwrap_err();
        assert!(matches!(err, DiskforgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_source() {
        let tmp = tempfile::tempdir().unwrap();
        let converter = Converter::new(test_options(&tmp.path().join("forge"))).unwrap();

        let err = converter.submit(ConvertRequest::new("")).unwrap_err();
        assert!(matches!(err, DiskforgeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_zero_size_as_allocation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("forge");
        let converter = Converter::new(test_options(&home)).unwrap();

        let mut request = ConvertRequest::new("alpine:latest");
        request.output = Some(PathBuf::from("zero.img"));
        request.size_mb = 0;
        let err = converter.submit(request).unwrap_err();
        assert!(matches!(err, DiskforgeError::Allocation(_)));

        // Rejected before any resource was acquired or the job registered.
        assert!(!home.join("images/zero.img").exists());
        assert!(converter.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_listing_empty_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let converter = Converter::new(test_options(&tmp.path().join("forge"))).unwrap();

        assert!(converter.list_artifacts().await.unwrap().is_empty());
        assert_eq!(converter.cleanup_artifacts().await.unwrap(), 0);
        assert!(converter.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_unknown_job() {
        let tmp = tempfile::tempdir().unwrap();
        let converter = Converter::new(test_options(&tmp.path().join("forge"))).unwrap();

        let err = converter.wait(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, DiskforgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_with_no_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let converter = Converter::new(test_options(&tmp.path().join("forge"))).unwrap();
        converter.shutdown().await.unwrap();
    }
}
