//! Generic table-driven pipeline execution framework.
//!
//! This module provides a reusable pipeline infrastructure that supports:
//! - Table-driven execution plans
//! - Sequential task execution with per-task timeouts
//! - Cooperative cancellation between tasks
//!
//! ## Architecture
//!
//! ```text
//! Pipeline → Tasks
//!
//! - Pipeline: Orchestrates execution of all tasks in order
//! - Task: Atomic unit of work, consumed when run
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineBuilder, PipelineControls, PipelineExecutor};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! struct Context;
//! struct TaskA;
//! struct TaskB;
//!
//! let plan = ExecutionPlan::new(vec![Box::new(TaskA), Box::new(TaskB)]);
//!
//! let ctx = Arc::new(Mutex::new(Context));
//! let pipeline = PipelineBuilder::from_plan(plan);
//! let metrics = PipelineExecutor::execute(pipeline, ctx, controls).await?;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod task;

pub use pipeline::{ExecutionPlan, PipelineBuilder, PipelineControls, PipelineExecutor};
pub use task::{BoxedTask, PipelineTask};
