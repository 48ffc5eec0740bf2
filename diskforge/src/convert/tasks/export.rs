//! Task: Source export.
//!
//! Materializes the container filesystem under the job's staging directory.

use super::{ConvertCtx, log_task_error, stage_start};
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::guard::Resource;
use crate::job::JobStage;
use crate::pipeline::PipelineTask;
use async_trait::async_trait;
use std::sync::Arc;

pub struct ExportTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for ExportTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::Exporting).await?;

        let (provider, source_ref, staging_dir) = {
            let mut ctx = ctx.lock().await;
            let staging_dir = ctx.runtime.layout.job_staging_dir(&job_id);
            let handle = ctx.guard.push(Resource::StagingDir(staging_dir.clone()));
            ctx.staging_handle = Some(handle);
            (
                Arc::clone(&ctx.runtime.source),
                ctx.spec.source_ref.clone(),
                staging_dir,
            )
        };

        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| {
                DiskforgeError::Source(format!(
                    "create staging dir {}: {}",
                    staging_dir.display(),
                    e
                ))
            })
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        let tree = provider
            .export(&source_ref, &staging_dir)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        tracing::info!(
            job_id = %job_id,
            source_ref = %source_ref,
            tree = %tree.display(),
            "source exported"
        );

        let mut ctx = ctx.lock().await;
        ctx.source_tree = Some(tree);
        Ok(())
    }

    fn name(&self) -> &str {
        "export_source"
    }
}
