//! Type definitions for the conversion pipeline.

use crate::boot::{DistroFamily, KernelOutcome};
use crate::disk::PartitionTable;
use crate::guard::{HandleId, ResourceGuard};
use crate::job::{JobId, JobSpec};
use crate::rootfs::PopulateStats;
use crate::runtime::RuntimeInner;
use std::path::PathBuf;

/// Shared conversion pipeline context.
///
/// Stores shared inputs and per-stage outputs across all tasks. Tasks take
/// what they need under the lock, drop it for the slow work, and re-lock to
/// store their output.
pub struct ConvertPipelineContext {
    pub runtime: RuntimeInner,
    pub job_id: JobId,
    pub spec: JobSpec,
    /// Rollback stack. Released by the orchestrator on every exit path.
    pub guard: ResourceGuard,

    /// Root of the exported tree (set by ExportTask). May live outside the
    /// staging dir when the source is already a directory.
    pub source_tree: Option<PathBuf>,
    /// Exact image length (set by AllocateTask).
    pub image_bytes: Option<u64>,
    /// Layout written to the image (set by PartitionTask).
    pub table: Option<PartitionTable>,
    /// Loop device backing the image during the build window.
    pub loop_device: Option<PathBuf>,
    /// Partition node under the loop device.
    pub part_device: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub populate_stats: Option<PopulateStats>,
    pub distro: Option<DistroFamily>,
    pub kernel: Option<KernelOutcome>,
    /// Human-readable qualifiers folded into the final result message.
    pub notes: Vec<String>,
    /// On-disk size of the finished image (set by FinalizeTask).
    pub output_size_mb: Option<u64>,
    pub sha256: Option<String>,

    /// Guard handles for targeted release during finalization.
    pub staging_handle: Option<HandleId>,
    pub loop_handle: Option<HandleId>,
    pub mount_handle: Option<HandleId>,
}

impl ConvertPipelineContext {
    pub fn new(runtime: RuntimeInner, job_id: JobId, spec: JobSpec) -> Self {
        let guard = ResourceGuard::new(job_id.clone());
        Self {
            runtime,
            job_id,
            spec,
            guard,
            source_tree: None,
            image_bytes: None,
            table: None,
            loop_device: None,
            part_device: None,
            mount_point: None,
            populate_stats: None,
            distro: None,
            kernel: None,
            notes: Vec::new(),
            output_size_mb: None,
            sha256: None,
            staging_handle: None,
            loop_handle: None,
            mount_handle: None,
        }
    }
}
