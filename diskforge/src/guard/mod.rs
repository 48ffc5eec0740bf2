//! Per-job resource rollback stack.
//!
//! Every acquired resource (staging tree, partial image, loop device,
//! mounts) is pushed onto the job's guard. Release happens in reverse
//! acquisition order, tolerates individual failures, and is idempotent per
//! handle. The guard also releases whatever is left when dropped, so a
//! panicking or aborted job cannot leak mounts or loop devices.

use crate::disk::mount;
use crate::job::JobId;
use crate::loopdev;
use std::path::PathBuf;
use tokio::sync::OwnedSemaphorePermit;

/// One tracked resource.
pub(crate) enum Resource {
    /// Staging directory holding the exported tree. Removed on release.
    StagingDir(PathBuf),
    /// The output image file. Removed on release unless kept.
    Artifact(PathBuf),
    /// Attached loop device together with its pool slot.
    LoopDevice {
        device: PathBuf,
        permit: Option<OwnedSemaphorePermit>,
    },
    /// Mounted partition. Unmounted on release, mount dir removed.
    MountPoint(PathBuf),
    /// Bind mount inside the image tree.
    BindMount(PathBuf),
}

impl Resource {
    fn describe(&self) -> String {
        match self {
            Resource::StagingDir(p) => format!("staging dir {}", p.display()),
            Resource::Artifact(p) => format!("artifact {}", p.display()),
            Resource::LoopDevice { device, .. } => format!("loop device {}", device.display()),
            Resource::MountPoint(p) => format!("mount point {}", p.display()),
            Resource::BindMount(p) => format!("bind mount {}", p.display()),
        }
    }
}

/// Stable handle to a pushed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandleId(usize);

pub(crate) struct ResourceGuard {
    job: JobId,
    entries: Vec<Option<Resource>>,
}

impl ResourceGuard {
    pub fn new(job: JobId) -> Self {
        Self {
            job,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, resource: Resource) -> HandleId {
        tracing::debug!(job_id = %self.job, "guarding {}", resource.describe());
        self.entries.push(Some(resource));
        HandleId(self.entries.len() - 1)
    }

    /// Resources not yet released.
    pub fn outstanding(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    /// Disarm artifact entries so the finished image survives the final
    /// unwind. Call only after the image is complete.
    pub fn keep_artifact(&mut self) {
        for slot in &mut self.entries {
            if matches!(slot, Some(Resource::Artifact(_))) {
                *slot = None;
            }
        }
    }

    /// Release a single resource. A second release of the same handle is a
    /// no-op.
    pub async fn release(&mut self, handle: HandleId) {
        if let Some(resource) = self.entries.get_mut(handle.0).and_then(Option::take) {
            release_resource(&self.job, resource).await;
        }
    }

    /// Release everything still held, newest first. Failures are logged
    /// and do not stop the unwind.
    pub async fn release_all(&mut self) {
        for idx in (0..self.entries.len()).rev() {
            if let Some(resource) = self.entries[idx].take() {
                release_resource(&self.job, resource).await;
            }
        }
    }
}

async fn release_resource(job: &JobId, resource: Resource) {
    let what = resource.describe();
    tracing::debug!(job_id = %job, "releasing {}", what);

    match resource {
        Resource::StagingDir(path) => {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(job_id = %job, error = %e, "failed to remove {}", what);
                }
            }
        }
        Resource::Artifact(path) => match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(job_id = %job, "removed partial image {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id = %job, error = %e, "failed to remove {}", what),
        },
        Resource::LoopDevice { device, permit } => {
            if let Err(e) = loopdev::detach(&device).await {
                tracing::warn!(job_id = %job, error = %e, "failed to detach {}", what);
            }
            drop(permit);
        }
        Resource::MountPoint(path) => {
            if let Err(e) = mount::unmount_detach(&path) {
                tracing::warn!(job_id = %job, error = %e, "failed to unmount {}", what);
            }
            let _ = std::fs::remove_dir(&path);
        }
        Resource::BindMount(path) => {
            if let Err(e) = mount::unmount_detach(&path) {
                tracing::warn!(job_id = %job, error = %e, "failed to unmount {}", what);
            }
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        for idx in (0..self.entries.len()).rev() {
            if let Some(resource) = self.entries[idx].take() {
                tracing::warn!(
                    job_id = %self.job,
                    "releasing {} left over at guard drop",
                    resource.describe()
                );
                release_resource_sync(resource);
            }
        }
    }
}

/// Synchronous best-effort release for the drop path.
fn release_resource_sync(resource: Resource) {
    match resource {
        Resource::StagingDir(path) => {
            let _ = std::fs::remove_dir_all(&path);
        }
        Resource::Artifact(path) => {
            let _ = std::fs::remove_file(&path);
        }
        Resource::LoopDevice { device, permit } => {
            let _ = std::process::Command::new("losetup")
                .arg("-d")
                .arg(&device)
                .output();
            drop(permit);
        }
        Resource::MountPoint(path) => {
            let _ = mount::unmount_detach(&path);
            let _ = std::fs::remove_dir(&path);
        }
        Resource::BindMount(path) => {
            let _ = mount::unmount_detach(&path);
        }
    }
}
