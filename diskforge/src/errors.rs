//! Error taxonomy for the conversion pipeline.
//!
//! Every stage maps its failures onto one `DiskforgeError` variant so the
//! orchestrator can decide between abort-and-rollback and warn-and-continue
//! without inspecting stage internals.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type DiskforgeResult<T> = std::result::Result<T, DiskforgeError>;

#[derive(Debug, thiserror::Error)]
pub enum DiskforgeError {
    /// Image file could not be created at the requested size.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Partition table could not be written.
    #[error("partitioning failed: {0}")]
    Partition(String),

    /// Filesystem creation on the partition device failed.
    #[error("filesystem creation failed: {0}")]
    Format(String),

    /// Copying the source tree into the mounted image failed.
    #[error("population failed at {path}: {reason}")]
    Population { path: PathBuf, reason: String },

    /// Kernel installation inside the image failed. Non-fatal: the
    /// orchestrator records it and continues to the boot loader.
    #[error("kernel install failed: {0}")]
    KernelInstall(String),

    /// Boot loader or boot sector installation failed. Always fatal.
    #[error("bootloader install failed: {0}")]
    Bootloader(String),

    /// Source export boundary failed to produce a filesystem tree.
    #[error("source export failed: {0}")]
    Source(String),

    /// A pooled resource (loop device slot) could not be acquired.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Another running job already owns the requested output path.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stage exceeded its configured deadline.
    #[error("stage '{stage}' timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    /// The job was cancelled between stages.
    #[error("job cancelled")]
    Cancelled,

    /// An external command exited non-zero.
    #[error("command '{program}' failed (exit {code:?}): {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DiskforgeError {
    /// Whether this error must abort the job. Only kernel installation is
    /// allowed to fail without tearing the pipeline down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DiskforgeError::KernelInstall(_))
    }
}

/// Snapshot of a failure, attached to the job record and surfaced in results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Stage name at the time of failure.
    pub stage: String,
    pub message: String,
    /// Exit code when the failure came from an external command.
    pub exit_code: Option<i32>,
}

impl ErrorDetail {
    pub fn from_error(stage: &str, err: &DiskforgeError) -> Self {
        let exit_code = match err {
            DiskforgeError::Command { code, .. } => *code,
            _ => None,
        };
        Self {
            stage: stage.to_string(),
            message: err.to_string(),
            exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_install_is_non_fatal() {
        assert!(!DiskforgeError::KernelInstall("apt-get update failed".into()).is_fatal());
        assert!(DiskforgeError::Bootloader("extlinux missing".into()).is_fatal());
        assert!(DiskforgeError::Cancelled.is_fatal());
    }

    #[test]
    fn test_error_detail_captures_exit_code() {
        let err = DiskforgeError::Command {
            program: "sfdisk".into(),
            code: Some(1),
            stderr: "bad script".into(),
        };
        let detail = ErrorDetail::from_error("partitioning", &err);
        assert_eq!(detail.stage, "partitioning");
        assert_eq!(detail.exit_code, Some(1));
        assert!(detail.message.contains("sfdisk"));
    }

    #[test]
    fn test_timeout_display_names_stage() {
        let err = DiskforgeError::Timeout {
            stage: "formatting".into(),
            seconds: 600,
        };
        assert_eq!(err.to_string(), "stage 'formatting' timed out after 600s");
    }
}
