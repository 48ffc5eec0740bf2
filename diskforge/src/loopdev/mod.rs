//! Loop device pool.
//!
//! Loop devices are a host-wide resource, so attachments go through a
//! bounded pool. A slot must be held before `losetup` runs; what happens
//! when every slot is busy is the runtime's `ExhaustPolicy`.

use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::runtime::options::ExhaustPolicy;
use crate::util::process;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub(crate) struct LoopPool {
    slots: Arc<Semaphore>,
    capacity: usize,
    policy: ExhaustPolicy,
}

/// A loop device attached to an image file.
///
/// Carries the pool slot. Ownership is handed to the rollback guard via
/// `into_parts`; an attachment dropped before that handoff detaches the
/// device itself, so a stage timeout between attach and guard push cannot
/// leak it.
#[derive(Debug)]
pub(crate) struct LoopAttachment {
    device: PathBuf,
    permit: Option<OwnedSemaphorePermit>,
}

impl LoopAttachment {
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Hand over the device path and pool slot, disarming the drop detach.
    pub fn into_parts(mut self) -> (PathBuf, Option<OwnedSemaphorePermit>) {
        (std::mem::take(&mut self.device), self.permit.take())
    }
}

impl Drop for LoopAttachment {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            tracing::warn!(
                device = %self.device.display(),
                "loop attachment dropped before handoff, detaching"
            );
            let _ = std::process::Command::new("losetup")
                .arg("-d")
                .arg(&self.device)
                .output();
            drop(permit);
        }
    }
}

impl LoopPool {
    pub fn new(capacity: usize, policy: ExhaustPolicy) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
        }
    }

    async fn acquire_slot(&self) -> DiskforgeResult<OwnedSemaphorePermit> {
        match self.policy {
            ExhaustPolicy::FailFast => {
                Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
                    DiskforgeError::ResourceExhausted(format!(
                        "all {} loop device slots are busy",
                        self.capacity
                    ))
                })
            }
            ExhaustPolicy::Wait { timeout_secs } => {
                let acquire = Arc::clone(&self.slots).acquire_owned();
                match tokio::time::timeout(Duration::from_secs(timeout_secs), acquire).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(DiskforgeError::Internal(
                        "loop pool semaphore closed".to_string(),
                    )),
                    Err(_) => Err(DiskforgeError::ResourceExhausted(format!(
                        "no loop device slot became free within {}s",
                        timeout_secs
                    ))),
                }
            }
        }
    }

    /// Attach an image with partition scanning (`losetup -P`).
    pub async fn attach(&self, image: &Path) -> DiskforgeResult<LoopAttachment> {
        let permit = self.acquire_slot().await?;

        let stdout = process::run_capture(
            "losetup",
            [
                OsStr::new("-P"),
                OsStr::new("--find"),
                OsStr::new("--show"),
                image.as_os_str(),
            ],
        )
        .await
        .map_err(|e| match e {
            DiskforgeError::Command {
                program,
                code,
                stderr,
            } => DiskforgeError::Format(format!(
                "{} could not attach {}: exit {:?}: {}",
                program,
                image.display(),
                code,
                stderr
            )),
            other => other,
        })?;

        let device = PathBuf::from(stdout.trim());
        if device.as_os_str().is_empty() {
            return Err(DiskforgeError::Format(
                "losetup reported no device".to_string(),
            ));
        }

        tracing::info!(
            image = %image.display(),
            device = %device.display(),
            "loop device attached"
        );
        Ok(LoopAttachment {
            device,
            permit: Some(permit),
        })
    }
}

impl std::fmt::Debug for LoopPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopPool")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Detach a loop device. The pool slot itself frees when the
/// `LoopAttachment` drops.
pub(crate) async fn detach(device: &Path) -> DiskforgeResult<()> {
    process::run_capture("losetup", [OsStr::new("-d"), device.as_os_str()]).await?;
    tracing::debug!(device = %device.display(), "loop device detached");
    Ok(())
}

/// Wait for a partition node to appear under /dev. The kernel publishes
/// `<loop>pN` asynchronously after the `-P` scan.
pub(crate) async fn wait_for_partition(device: &Path, deadline: Duration) -> DiskforgeResult<()> {
    let start = Instant::now();
    loop {
        if device.exists() {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(DiskforgeError::Format(format!(
                "partition device {} did not appear within {:?}",
                device.display(),
                deadline
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_fast_pool_exhaustion() {
        // Zero capacity: the slot acquire fails before losetup would run.
        let pool = LoopPool::new(0, ExhaustPolicy::FailFast);
        let err = pool.attach(Path::new("/tmp/unused.img")).await.unwrap_err();
        assert!(matches!(err, DiskforgeError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_wait_pool_times_out() {
        let pool = LoopPool::new(0, ExhaustPolicy::Wait { timeout_secs: 0 });
        let err = pool.attach(Path::new("/tmp/unused.img")).await.unwrap_err();
        match err {
            DiskforgeError::ResourceExhausted(msg) => assert!(msg.contains("0s")),
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attachment_drop_frees_slot_and_detaches() {
        let slots = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&slots).try_acquire_owned().unwrap();
        let attachment = LoopAttachment {
            device: PathBuf::from("/no/such/loop"),
            permit: Some(permit),
        };

        assert_eq!(slots.available_permits(), 0);
        // Detach of the bogus device fails harmlessly; the slot comes back.
        drop(attachment);
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_into_parts_hands_slot_to_caller() {
        let slots = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&slots).try_acquire_owned().unwrap();
        let attachment = LoopAttachment {
            device: PathBuf::from("/no/such/loop"),
            permit: Some(permit),
        };

        let (device, permit) = attachment.into_parts();
        assert_eq!(device, PathBuf::from("/no/such/loop"));
        // The slot travels with the handoff, not the consumed attachment.
        assert_eq!(slots.available_permits(), 0);
        drop(permit);
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_partition_present() {
        let tmp = tempfile::tempdir().unwrap();
        let node = tmp.path().join("loop0p1");
        std::fs::write(&node, b"").unwrap();
        wait_for_partition(&node, Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_partition_gives_up() {
        let err = wait_for_partition(Path::new("/no/such/node"), Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::Format(_)));
    }
}
