//! Conversion job records and the in-memory registry.

pub(crate) mod manager;
mod types;

pub(crate) use manager::JobManager;
pub use types::{JobId, JobSnapshot, JobStage, JobStatus};
pub(crate) use types::JobSpec;
