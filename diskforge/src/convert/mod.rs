//! Conversion orchestration.
//!
//! ## Architecture
//!
//! A conversion is table-driven and strictly sequential:
//!
//! ```text
//! 1. ExportTask          (materialize the container tree)
//! 2. AllocateTask        (sparse image file)
//! 3. PartitionTask       (single bootable DOS partition)
//! 4. FormatTask          (loop attach + mkfs)
//! 5. MountTask           (mount the partition, bounded retries)
//! 6. PopulateTask        (copy the tree into the image)
//! 7. KernelInstallTask   (distro detect + chroot install, best-effort)
//! 8. BootloaderTask      (extlinux into the mounted tree)
//! 9. FinalizeTask        (unmount, detach, boot sector, manifest)
//! ```
//!
//! `ResourceGuard` provides rollback on failure; the orchestrator unwinds
//! it on every exit path, so a failed job leaves no partial image, mount,
//! or loop device behind.

mod result;
mod tasks;
mod types;

pub use result::ConversionResult;

use crate::disk::FilesystemKind;
use crate::errors::{DiskforgeError, ErrorDetail};
use crate::job::{JobId, JobSpec, JobStatus};
use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineControls, PipelineExecutor,
};
use crate::runtime::RuntimeInner;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tokio::sync::Mutex;

use tasks::{
    AllocateTask, BootloaderTask, ConvertCtx, ExportTask, FinalizeTask, FormatTask,
    KernelInstallTask, MountTask, PartitionTask, PopulateTask,
};
use types::ConvertPipelineContext;

/// Output filename used when a request names none.
pub const DEFAULT_OUTPUT_FILENAME: &str = "bootable_system.img";

/// Image size used when a request names none.
pub const DEFAULT_DISK_SIZE_MB: u64 = 2048;

/// Parameters for one conversion.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    /// Exported tree directory or tarball handed to the source provider.
    pub source_ref: String,
    /// Output image path. Relative paths resolve under the runtime images
    /// directory; `None` uses [`DEFAULT_OUTPUT_FILENAME`] there.
    pub output: Option<PathBuf>,
    pub size_mb: u64,
    pub filesystem: FilesystemKind,
    /// Replace an existing file at the output path.
    pub overwrite: bool,
}

impl ConvertRequest {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            output: None,
            size_mb: DEFAULT_DISK_SIZE_MB,
            filesystem: FilesystemKind::default(),
            overwrite: false,
        }
    }
}

// ============================================================================
// EXECUTION PLAN
// ============================================================================

fn execution_plan() -> ExecutionPlan<ConvertCtx> {
    let tasks: Vec<BoxedTask<ConvertCtx>> = vec![
        Box::new(ExportTask),
        Box::new(AllocateTask),
        Box::new(PartitionTask),
        Box::new(FormatTask),
        Box::new(MountTask),
        Box::new(PopulateTask),
        Box::new(KernelInstallTask),
        Box::new(BootloaderTask),
        Box::new(FinalizeTask),
    ];
    ExecutionPlan::new(tasks)
}

/// Drive one registered job to a terminal status.
///
/// Infallible by construction: every outcome, including pipeline errors
/// and cancellation, is folded into the returned `ConversionResult` after
/// the rollback stack has been unwound and the registry updated.
pub(crate) async fn run_job(
    runtime: RuntimeInner,
    job_id: JobId,
    spec: JobSpec,
    cancel: Arc<AtomicBool>,
) -> ConversionResult {
    let total_start = Instant::now();

    let controls = PipelineControls {
        cancel,
        task_timeout: runtime.options.stage_timeout(),
    };
    let ctx: ConvertCtx = Arc::new(Mutex::new(ConvertPipelineContext::new(
        runtime.clone(),
        job_id.clone(),
        spec.clone(),
    )));

    let pipeline = PipelineBuilder::from_plan(execution_plan());
    let outcome = PipelineExecutor::execute(pipeline, Arc::clone(&ctx), controls).await;

    let mut ctx = ctx.lock().await;
    // On success only the staging dir is still held (FinalizeTask released
    // the build window and disarmed the artifact); on failure everything
    // rolls back, partial image included.
    ctx.guard.release_all().await;

    let duration_ms = total_start.elapsed().as_millis();
    let warnings = runtime
        .jobs
        .snapshot(&job_id)
        .ok()
        .flatten()
        .map(|snap| snap.warnings)
        .unwrap_or_default();

    match outcome {
        Ok(metrics) => {
            tracing::info!(
                job_id = %job_id,
                duration_ms = metrics.total_duration_ms as u64,
                "conversion pipeline complete"
            );
            if let Err(e) = runtime.jobs.finish(&job_id, JobStatus::Succeeded, None) {
                tracing::warn!(job_id = %job_id, error = %e, "failed to record success");
            }

            let filename = spec
                .output_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| spec.output_path.display().to_string());
            let mut message = format!(
                "Successfully converted {} to bootable {}",
                spec.source_ref, filename
            );
            if !ctx.notes.is_empty() {
                message = format!("{} ({})", message, ctx.notes.join("; "));
            }

            ConversionResult {
                status: JobStatus::Succeeded,
                job_id,
                source_ref: spec.source_ref,
                output_file: Some(spec.output_path),
                file_size_mb: ctx.output_size_mb,
                disk_size_mb: spec.size_mb,
                filesystem_type: spec.filesystem,
                distro_family: ctx.distro,
                kernel_installed: ctx.kernel.as_ref().is_some_and(|k| k.installed),
                sha256: ctx.sha256.clone(),
                duration_ms,
                message,
                warnings,
                error: None,
            }
        }
        Err(error) => {
            let cancelled = matches!(error, DiskforgeError::Cancelled);
            let status = if cancelled {
                JobStatus::Cancelled
            } else {
                JobStatus::Failed
            };
            let stage = runtime
                .jobs
                .snapshot(&job_id)
                .ok()
                .flatten()
                .map(|snap| snap.stage.as_str())
                .unwrap_or("pending");
            let detail = ErrorDetail::from_error(stage, &error);

            if let Err(e) = runtime.jobs.update_resources(&job_id, |r| r.clear()) {
                tracing::warn!(job_id = %job_id, error = %e, "failed to clear resource handles");
            }
            if let Err(e) = runtime.jobs.finish(&job_id, status, Some(detail.clone())) {
                tracing::warn!(job_id = %job_id, error = %e, "failed to record failure");
            }

            let message = if cancelled {
                tracing::info!(job_id = %job_id, stage = stage, "conversion cancelled");
                format!("conversion of {} cancelled during {}", spec.source_ref, stage)
            } else {
                tracing::error!(
                    job_id = %job_id,
                    stage = stage,
                    error = %error,
                    "conversion failed"
                );
                format!(
                    "conversion of {} failed during {}: {}",
                    spec.source_ref, stage, error
                )
            };

            ConversionResult {
                status,
                job_id,
                source_ref: spec.source_ref,
                output_file: None,
                file_size_mb: None,
                disk_size_mb: spec.size_mb,
                filesystem_type: spec.filesystem,
                distro_family: ctx.distro,
                kernel_installed: false,
                sha256: None,
                duration_ms,
                message,
                warnings,
                error: Some(detail),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = ConvertRequest::new("alpine:latest");
        assert_eq!(request.source_ref, "alpine:latest");
        assert_eq!(request.size_mb, DEFAULT_DISK_SIZE_MB);
        assert_eq!(request.filesystem, FilesystemKind::Ext4);
        assert!(!request.overwrite);
        assert!(request.output.is_none());
    }

    #[test]
    fn test_execution_plan_order() {
        let tasks = execution_plan().tasks();
        let names: Vec<&str> = tasks.iter().map(|task| task.name()).collect();
        assert_eq!(
            names,
            vec![
                "export_source",
                "allocate_image",
                "partition_image",
                "format_filesystem",
                "mount_partition",
                "populate_rootfs",
                "install_kernel",
                "install_bootloader",
                "finalize_image",
            ]
        );
    }
}
