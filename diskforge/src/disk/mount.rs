//! Mount syscall wrappers for the build window.
//!
//! Requires CAP_SYS_ADMIN, like the rest of the loop device workflow.

use crate::disk::format::FilesystemKind;
use crate::errors::{DiskforgeError, DiskforgeResult};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::Path;

/// Mount a formatted partition device at `target`.
pub(crate) fn mount_block(
    device: &Path,
    target: &Path,
    kind: FilesystemKind,
) -> DiskforgeResult<()> {
    mount(
        Some(device),
        target,
        Some(kind.as_str()),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| {
        DiskforgeError::Format(format!(
            "mount {} at {}: {}",
            device.display(),
            target.display(),
            e
        ))
    })?;

    tracing::debug!(
        device = %device.display(),
        target = %target.display(),
        filesystem = kind.as_str(),
        "partition mounted"
    );
    Ok(())
}

/// Bind a host directory into the image tree (chroot plumbing).
pub(crate) fn bind_mount(source: &Path, target: &Path) -> DiskforgeResult<()> {
    std::fs::create_dir_all(target)?;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        DiskforgeError::KernelInstall(format!(
            "bind mount {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}

/// Unmount with lazy detach.
///
/// Idempotent: a target that is not mounted (EINVAL) or no longer exists
/// (ENOENT) counts as unmounted.
pub(crate) fn unmount_detach(target: &Path) -> DiskforgeResult<()> {
    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "unmounted");
            Ok(())
        }
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(DiskforgeError::Internal(format!(
            "unmount {}: {}",
            target.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmount_of_plain_dir_is_ok() {
        // Unprivileged umount2 fails EPERM before the mount-point check.
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        // Not a mount point: EINVAL, treated as already unmounted.
        let tmp = tempfile::tempdir().unwrap();
        unmount_detach(tmp.path()).unwrap();
    }

    #[test]
    fn test_unmount_of_missing_path_is_ok() {
        unmount_detach(Path::new("/definitely/not/mounted/anywhere")).unwrap();
    }
}
