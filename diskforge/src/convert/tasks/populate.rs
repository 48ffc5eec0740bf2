//! Task: Root filesystem population.

use super::{ConvertCtx, log_task_error, stage_start};
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::job::JobStage;
use crate::pipeline::PipelineTask;
use crate::rootfs;
use async_trait::async_trait;

pub struct PopulateTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for PopulateTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Populating).await?;

        let (source_tree, mount_point) = {
            let ctx = ctx.lock().await;
            let source = ctx.source_tree.clone().ok_or_else(|| {
                DiskforgeError::Internal("populating before export".to_string())
            })?;
            let mount = ctx.mount_point.clone().ok_or_else(|| {
                DiskforgeError::Internal("populating before mount".to_string())
            })?;
            (source, mount)
        };

        let stats = rootfs::populate(&source_tree, &mount_point)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        tracing::info!(
            job_id = %job_id,
            entries = stats.entries(),
            files = stats.files,
            bytes = stats.bytes,
            "root filesystem populated"
        );

        let mut ctx = ctx.lock().await;
        ctx.populate_stats = Some(stats);
        Ok(())
    }

    fn name(&self) -> &str {
        "populate_rootfs"
    }
}
