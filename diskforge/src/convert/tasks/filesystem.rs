//! Tasks: Filesystem creation and the build-window mount.
//!
//! FormatTask attaches the image to a loop device and runs mkfs against
//! the partition node. MountTask mounts that partition with a bounded
//! retry, because the node can lag the partition scan on busy hosts.

use super::{ConvertCtx, log_task_error, stage_start};
use crate::disk::{format, mount};
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::guard::Resource;
use crate::job::JobStage;
use crate::loopdev;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use std::time::Duration;

/// How long FormatTask waits for the kernel to publish the partition node.
const PARTITION_NODE_WAIT: Duration = Duration::from_secs(5);

/// Backoff unit between mount attempts.
const MOUNT_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct FormatTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for FormatTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Formatting).await?;

        let (runtime, output_path, table, filesystem) = {
            let ctx = ctx.lock().await;
            let table = ctx.table.clone().ok_or_else(|| {
                DiskforgeError::Internal("formatting before partitioning".to_string())
            })?;
            (
                ctx.runtime.clone(),
                ctx.spec.output_path.clone(),
                table,
                ctx.spec.filesystem,
            )
        };

        let attachment = runtime
            .loop_pool
            .attach(&output_path)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let part_device = table.device_on(attachment.device());

        {
            let mut ctx = ctx.lock().await;
            // Handoff disarms the attachment's own detach; from here the
            // guard owns the device.
            let (device, permit) = attachment.into_parts();
            let handle = ctx.guard.push(Resource::LoopDevice {
                device: device.clone(),
                permit,
            });
            ctx.loop_handle = Some(handle);
            ctx.loop_device = Some(device.clone());
            ctx.runtime.jobs.update_resources(&job_id, |r| {
                r.loop_device = Some(device);
            })?;
        }

        loopdev::wait_for_partition(&part_device, PARTITION_NODE_WAIT)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        format::make_filesystem(&part_device, filesystem)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.part_device = Some(part_device);
        Ok(())
    }

    fn name(&self) -> &str {
        "format_filesystem"
    }
}

pub struct MountTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for MountTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Mounting).await?;

        let (part_device, mount_dir, filesystem, retry_limit) = {
            let ctx = ctx.lock().await;
            let part_device = ctx.part_device.clone().ok_or_else(|| {
                DiskforgeError::Internal("mounting before formatting".to_string())
            })?;
            (
                part_device,
                ctx.runtime.layout.job_mount_dir(&job_id),
                ctx.spec.filesystem,
                ctx.runtime.options.mount_retry_limit.max(1),
            )
        };

        tokio::fs::create_dir_all(&mount_dir)
            .await
            .map_err(DiskforgeError::from)
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        // Guarded before the first attempt: release unmounts when needed
        // and removes the directory either way.
        {
            let mut ctx = ctx.lock().await;
            let handle = ctx.guard.push(Resource::MountPoint(mount_dir.clone()));
            ctx.mount_handle = Some(handle);
        }

        let mut attempt = 1;
        loop {
            match mount::mount_block(&part_device, &mount_dir, filesystem) {
                Ok(()) => break,
                Err(e) if attempt < retry_limit => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = attempt,
                        error = %e,
                        "mount attempt failed, retrying"
                    );
                    tokio::time::sleep(MOUNT_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    log_task_error(&job_id, task_name, &e);
                    return Err(e);
                }
            }
        }

        let mut ctx = ctx.lock().await;
        ctx.mount_point = Some(mount_dir.clone());
        ctx.runtime.jobs.update_resources(&job_id, |r| {
            r.mount_point = Some(mount_dir);
        })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "mount_partition"
    }
}
