//! Final conversion report.

use crate::boot::DistroFamily;
use crate::disk::FilesystemKind;
use crate::errors::ErrorDetail;
use crate::job::{JobId, JobStatus};
use serde::{Serialize, Serializer};
use std::path::PathBuf;

/// Everything a caller needs to know about a finished conversion.
///
/// Produced for every terminal outcome; `status` says which fields are
/// meaningful. `message` always carries the one-line human summary,
/// including kernel-install degradations on success.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    /// Serializes as `"success"` or `"error"`; the full terminal status
    /// stays available in code.
    #[serde(serialize_with = "wire_status")]
    pub status: JobStatus,
    pub job_id: JobId,
    pub source_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    /// Actual on-disk size of the finished image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_mb: Option<u64>,
    /// Requested image size.
    pub disk_size_mb: u64,
    pub filesystem_type: FilesystemKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distro_family: Option<DistroFamily>,
    pub kernel_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub duration_ms: u128,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl ConversionResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

fn wire_status<S>(status: &JobStatus, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let wire = match status {
        JobStatus::Succeeded => "success",
        _ => "error",
    };
    serializer.serialize_str(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(status: JobStatus) -> ConversionResult {
        ConversionResult {
            status,
            job_id: JobId::new(),
            source_ref: "alpine-tree".to_string(),
            output_file: Some(PathBuf::from("/tmp/a.img")),
            file_size_mb: Some(1024),
            disk_size_mb: 1024,
            filesystem_type: FilesystemKind::Ext4,
            distro_family: Some(DistroFamily::Alpine),
            kernel_installed: false,
            sha256: None,
            duration_ms: 7,
            message: "ok".to_string(),
            warnings: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_status_serializes_to_wire_strings() {
        let json = serde_json::to_value(result_with(JobStatus::Succeeded)).unwrap();
        assert_eq!(json["status"], "success");

        let json = serde_json::to_value(result_with(JobStatus::Failed)).unwrap();
        assert_eq!(json["status"], "error");

        let json = serde_json::to_value(result_with(JobStatus::Cancelled)).unwrap();
        assert_eq!(json["status"], "error");
    }

    #[test]
    fn test_succeeded_tracks_full_status() {
        assert!(result_with(JobStatus::Succeeded).succeeded());
        assert!(!result_with(JobStatus::Failed).succeeded());
    }
}
