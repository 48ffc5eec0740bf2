//! Conversion pipeline task implementations.
//!
//! Every task follows the same shape: advance the job stage, take what it
//! needs from the shared context under the lock, drop the lock for the
//! slow work, then re-lock to store outputs and guard entries.

mod boot;
mod export;
mod filesystem;
mod finalize;
mod image;
mod populate;

pub(crate) use boot::{BootloaderTask, KernelInstallTask};
pub(crate) use export::ExportTask;
pub(crate) use filesystem::{FormatTask, MountTask};
pub(crate) use finalize::FinalizeTask;
pub(crate) use image::{AllocateTask, PartitionTask};
pub(crate) use populate::PopulateTask;

use crate::convert::types::ConvertPipelineContext;
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::job::{JobId, JobStage};
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) type ConvertCtx = Arc<Mutex<ConvertPipelineContext>>;

/// Advance the job to `stage` and return its id for logging.
pub(super) async fn stage_start(ctx: &ConvertCtx, stage: JobStage) -> DiskforgeResult<JobId> {
    let ctx = ctx.lock().await;
    ctx.runtime.jobs.enter_stage(&ctx.job_id, stage)?;
    Ok(ctx.job_id.clone())
}

pub(super) fn log_task_error(job_id: &JobId, task_name: &str, error: &DiskforgeError) {
    tracing::error!(job_id = %job_id, task = task_name, error = %error, "task failed");
}
