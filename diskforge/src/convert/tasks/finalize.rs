//! Task: Finalization.
//!
//! Orderly teardown of the build window (unmount, loop detach), then the
//! parts that must happen with nothing holding the image open: boot
//! sector write, digest, manifest. Ends by disarming the artifact guard
//! so the image survives the final unwind.

use super::{ConvertCtx, log_task_error, stage_start};
use crate::artifacts::{self, ArtifactManifest};
use crate::boot::mbr;
use crate::disk::allocate::BYTES_PER_MIB;
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::job::JobStage;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use chrono::Utc;

pub struct FinalizeTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for FinalizeTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Finalizing).await?;

        let (runtime, output_path) = {
            let ctx = ctx.lock().await;
            (ctx.runtime.clone(), ctx.spec.output_path.clone())
        };

        // Close the build window before touching sector zero.
        {
            let mut ctx = ctx.lock().await;
            if let Some(handle) = ctx.mount_handle.take() {
                ctx.guard.release(handle).await;
            }
            ctx.mount_point = None;
            if let Some(handle) = ctx.loop_handle.take() {
                ctx.guard.release(handle).await;
            }
            ctx.loop_device = None;
            ctx.part_device = None;
            ctx.runtime.jobs.update_resources(&job_id, |r| r.clear())?;
        }

        let mbr_bin = runtime.options.mbr_bin_path.clone();
        let image = output_path.clone();
        tokio::task::spawn_blocking(move || mbr::write_boot_sector(&image, &mbr_bin))
            .await
            .map_err(|e| {
                DiskforgeError::Internal(format!("boot sector task panicked: {}", e))
            })?
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let sha256 = artifacts::sha256_file(&output_path)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let file_len = tokio::fs::metadata(&output_path).await?.len();
        let size_mb = file_len / BYTES_PER_MIB;

        let manifest = {
            let ctx = ctx.lock().await;
            ArtifactManifest {
                source_ref: ctx.spec.source_ref.clone(),
                disk_size_mb: ctx.spec.size_mb,
                filesystem_type: ctx.spec.filesystem,
                distro_family: ctx.distro.unwrap_or(crate::boot::DistroFamily::Unknown),
                kernel_installed: ctx.kernel.as_ref().is_some_and(|k| k.installed),
                sha256: sha256.clone(),
                completed_at: Utc::now(),
            }
        };
        artifacts::write_manifest(&output_path, &manifest)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.guard.keep_artifact();
        ctx.output_size_mb = Some(size_mb);
        ctx.sha256 = Some(sha256);

        tracing::info!(
            job_id = %job_id,
            image = %output_path.display(),
            size_mb = size_mb,
            "image finalized"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "finalize_image"
    }
}
