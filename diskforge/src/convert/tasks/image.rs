//! Tasks: Image allocation and partitioning.

use super::{ConvertCtx, log_task_error, stage_start};
use crate::disk::{allocate, partition};
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::guard::Resource;
use crate::job::JobStage;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;

pub struct AllocateTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for AllocateTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Allocating).await?;

        let (output_path, size_mb, overwrite) = {
            let ctx = ctx.lock().await;
            (
                ctx.spec.output_path.clone(),
                ctx.spec.size_mb,
                ctx.spec.overwrite,
            )
        };

        let bytes = allocate::allocate_image(&output_path, size_mb, overwrite)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        tracing::info!(
            job_id = %job_id,
            image = %output_path.display(),
            size_mb = size_mb,
            "image allocated"
        );

        // Guarded only once it exists: a pre-existing file that blocked
        // allocation must never be rolled back.
        let mut ctx = ctx.lock().await;
        ctx.guard.push(Resource::Artifact(output_path));
        ctx.image_bytes = Some(bytes);
        Ok(())
    }

    fn name(&self) -> &str {
        "allocate_image"
    }
}

pub struct PartitionTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for PartitionTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Partitioning).await?;

        let (output_path, image_bytes) = {
            let ctx = ctx.lock().await;
            let bytes = ctx.image_bytes.ok_or_else(|| {
                DiskforgeError::Internal("partitioning before allocation".to_string())
            })?;
            (ctx.spec.output_path.clone(), bytes)
        };

        let table = partition::partition_image(&output_path, image_bytes)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let mut ctx = ctx.lock().await;
        ctx.table = Some(table);
        Ok(())
    }

    fn name(&self) -> &str {
        "partition_image"
    }
}
