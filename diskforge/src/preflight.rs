//! Host environment checks.
//!
//! Run before a job is accepted, so a machine missing tools or privilege
//! rejects the request instead of failing mid-pipeline with a half-built
//! image to roll back.

use crate::disk::FilesystemKind;
use crate::errors::{DiskforgeError, DiskforgeResult};
use std::path::Path;

/// Tools every conversion shells out to, regardless of filesystem.
const REQUIRED_TOOLS: [&str; 4] = ["sfdisk", "losetup", "extlinux", "chroot"];

/// Verify the host can run a conversion: required binaries resolvable,
/// MBR boot code present, and enough privilege to mount.
pub(crate) fn check_host(filesystem: FilesystemKind, mbr_bin: &Path) -> DiskforgeResult<()> {
    for tool in REQUIRED_TOOLS {
        resolve(tool)?;
    }
    resolve(filesystem.mkfs_program())?;

    if !mbr_bin.is_file() {
        return Err(DiskforgeError::NotFound(format!(
            "MBR boot code {} not found, install syslinux-common",
            mbr_bin.display()
        )));
    }

    if !is_root() {
        return Err(DiskforgeError::InvalidState(
            "conversions require root: loop devices and mounts need CAP_SYS_ADMIN".to_string(),
        ));
    }

    Ok(())
}

fn resolve(tool: &str) -> DiskforgeResult<()> {
    which::which(tool).map(|_| ()).map_err(|_| {
        DiskforgeError::NotFound(format!("required tool '{}' not found on host", tool))
    })
}

fn is_root() -> bool {
    // SAFETY: geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_tool_set() {
        for tool in ["sfdisk", "losetup", "extlinux", "chroot"] {
            assert!(REQUIRED_TOOLS.contains(&tool));
        }
    }

    #[test]
    fn test_resolve_reports_missing_tool() {
        let err = resolve("no-such-binary-for-sure").unwrap_err();
        match err {
            DiskforgeError::NotFound(msg) => assert!(msg.contains("no-such-binary-for-sure")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_finds_common_tool() {
        resolve("sh").unwrap();
    }
}
