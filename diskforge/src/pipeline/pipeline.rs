//! Generic pipeline execution framework.
//!
//! Provides a table-driven pipeline executor that runs tasks in order,
//! honoring a cancellation flag between tasks and a timeout around each.

use super::metrics::{PipelineMetrics, TaskMetrics};
use super::task::BoxedTask;
use crate::errors::{DiskforgeError, DiskforgeResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub struct ExecutionPlan<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }

    pub fn tasks(self) -> Vec<BoxedTask<Ctx>> {
        self.tasks
    }
}

pub struct Pipeline<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.tasks())
    }
}

/// Runtime knobs the executor consults while driving a pipeline.
#[derive(Clone)]
pub struct PipelineControls {
    /// Set externally to stop the pipeline at the next task boundary.
    pub cancel: Arc<AtomicBool>,
    /// Upper bound on any single task.
    pub task_timeout: Duration,
}

/// Pipeline executor framework.
///
/// This provides the generic infrastructure for executing a table-driven
/// pipeline. The actual task execution logic is provided by task
/// implementations.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline.
    ///
    /// This is the core pipeline execution loop. It runs tasks in order,
    /// stopping at the first failure. Cancellation is observed between
    /// tasks; a task that overruns the timeout is dropped, which reaps any
    /// child process it spawned.
    ///
    /// Generic over:
    /// - `Ctx`: Shared pipeline context (use interior mutability for writes)
    pub async fn execute<Ctx>(
        pipeline: Pipeline<Ctx>,
        ctx: Ctx,
        controls: PipelineControls,
    ) -> DiskforgeResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut task_metrics = Vec::new();

        for task in pipeline.tasks {
            if controls.cancel.load(Ordering::SeqCst) {
                return Err(DiskforgeError::Cancelled);
            }

            let name = task.name().to_string();
            let task_start = Instant::now();
            tracing::debug!(task = %name, "pipeline task starting");

            match tokio::time::timeout(controls.task_timeout, task.run(ctx.clone())).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(DiskforgeError::Timeout {
                        stage: name,
                        seconds: controls.task_timeout.as_secs(),
                    });
                }
            }

            task_metrics.push(TaskMetrics {
                name,
                duration_ms: task_start.elapsed().as_millis(),
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            tasks: task_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    type RecCtx = Arc<Mutex<Vec<&'static str>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<RecCtx> for Record {
        async fn run(self: Box<Self>, ctx: RecCtx) -> DiskforgeResult<()> {
            ctx.lock().await.push(self.0);
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<RecCtx> for Fail {
        async fn run(self: Box<Self>, _ctx: RecCtx) -> DiskforgeResult<()> {
            Err(DiskforgeError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl PipelineTask<RecCtx> for Sleep {
        async fn run(self: Box<Self>, _ctx: RecCtx) -> DiskforgeResult<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "sleep"
        }
    }

    fn controls(timeout: Duration) -> PipelineControls {
        PipelineControls {
            cancel: Arc::new(AtomicBool::new(false)),
            task_timeout: timeout,
        }
    }

    #[tokio::test]
    async fn test_tasks_run_in_order() {
        let plan = ExecutionPlan::new(vec![
            Box::new(Record("a")) as BoxedTask<RecCtx>,
            Box::new(Record("b")),
            Box::new(Record("c")),
        ]);
        let ctx: RecCtx = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PipelineBuilder::from_plan(plan);
        let metrics =
            PipelineExecutor::execute(pipeline, Arc::clone(&ctx), controls(Duration::from_secs(5)))
                .await
                .unwrap();

        assert_eq!(*ctx.lock().await, vec!["a", "b", "c"]);
        assert_eq!(metrics.tasks.len(), 3);
        assert!(metrics.task_duration_ms("b").is_some());
        assert!(metrics.task_duration_ms("missing").is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_task() {
        let plan = ExecutionPlan::new(vec![Box::new(Record("a")) as BoxedTask<RecCtx>]);
        let ctx: RecCtx = Arc::new(Mutex::new(Vec::new()));
        let ctl = controls(Duration::from_secs(5));
        ctl.cancel.store(true, Ordering::SeqCst);

        let err = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), Arc::clone(&ctx), ctl)
            .await
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::Cancelled));
        assert!(ctx.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_stops_pipeline() {
        let plan = ExecutionPlan::new(vec![
            Box::new(Record("a")) as BoxedTask<RecCtx>,
            Box::new(Fail),
            Box::new(Record("c")),
        ]);
        let ctx: RecCtx = Arc::new(Mutex::new(Vec::new()));

        let err = PipelineExecutor::execute(
            PipelineBuilder::from_plan(plan),
            Arc::clone(&ctx),
            controls(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiskforgeError::Internal(_)));
        assert_eq!(*ctx.lock().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_slow_task_times_out() {
        let plan = ExecutionPlan::new(vec![Box::new(Sleep(Duration::from_secs(30))) as BoxedTask<RecCtx>]);
        let ctx: RecCtx = Arc::new(Mutex::new(Vec::new()));

        let err = PipelineExecutor::execute(
            PipelineBuilder::from_plan(plan),
            ctx,
            controls(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        match err {
            DiskforgeError::Timeout { stage, seconds } => {
                assert_eq!(stage, "sleep");
                assert_eq!(seconds, 0);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
