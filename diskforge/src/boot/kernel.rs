//! Kernel installation inside the image.
//!
//! Debian-family trees get a kernel via chroot apt-get; everything else is
//! left as shipped, with the skip surfaced in the result message. A failed
//! install is reported to the orchestrator as `KernelInstall`, which it
//! downgrades to a warning.

use crate::boot::distro::DistroFamily;
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::util::process;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Runs inside the chroot. linux-image-generic resolves to the current
/// kernel meta-package on Ubuntu-derived trees and pulls the initramfs
/// tooling with it.
const DEBIAN_INSTALL_SCRIPT: &str = "#!/bin/bash\n\
export DEBIAN_FRONTEND=noninteractive\n\
apt-get update\n\
apt-get install -y linux-image-generic systemd-sysv\n\
apt-get install -y extlinux syslinux-common\n";

const INSTALL_SCRIPT_NAME: &str = "install_kernel.sh";

/// Installer selection for a detected family. Closed set by design review:
/// a new family means a new variant here, not a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelInstallPlan {
    /// chroot apt-get with /dev, /proc, /sys bound from the host.
    DebianChroot,
    /// No installer for this family. Boot files must ship with the tree.
    Skip,
}

impl KernelInstallPlan {
    pub fn for_family(family: DistroFamily) -> Self {
        match family {
            DistroFamily::Debian => KernelInstallPlan::DebianChroot,
            DistroFamily::Alpine | DistroFamily::Unknown => KernelInstallPlan::Skip,
        }
    }
}

/// What the install stage concluded.
#[derive(Debug, Clone, Default)]
pub(crate) struct KernelOutcome {
    pub attempted: bool,
    /// A kernel image is present in the tree after the attempt.
    pub installed: bool,
    pub kernel_path: Option<String>,
    pub initrd_path: Option<String>,
}

/// Run the Debian chroot install against a mounted tree.
///
/// The caller is responsible for the /dev, /proc, /sys bind mounts. The
/// install script is written into the tree for the chroot to see and
/// removed afterwards, pass or fail.
pub(crate) async fn run_debian_chroot_install(root: &Path) -> DiskforgeResult<()> {
    let script_path = root.join(INSTALL_SCRIPT_NAME);
    tokio::fs::write(&script_path, DEBIAN_INSTALL_SCRIPT)
        .await
        .map_err(|e| DiskforgeError::KernelInstall(format!("write install script: {}", e)))?;
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| DiskforgeError::KernelInstall(format!("chmod install script: {}", e)))?;

    let result = process::run_capture(
        "chroot",
        [
            root.as_os_str(),
            std::ffi::OsStr::new("/install_kernel.sh"),
        ],
    )
    .await;

    if let Err(e) = tokio::fs::remove_file(&script_path).await {
        tracing::warn!(
            path = %script_path.display(),
            error = %e,
            "failed to remove install script from image"
        );
    }

    result.map_err(|e| match e {
        DiskforgeError::Command {
            program,
            code,
            stderr,
        } => DiskforgeError::KernelInstall(format!(
            "{} exited with {:?}: {}",
            program, code, stderr
        )),
        other => DiskforgeError::KernelInstall(other.to_string()),
    })?;
    Ok(())
}

/// Locate kernel and initrd paths in the tree, as the booted system will
/// see them.
///
/// Debian installs maintain /vmlinuz and /initrd.img symlinks at the
/// root; those win. Otherwise the lexically greatest versioned pair under
/// boot/ is used, which tracks the newest install closely enough for a
/// single-kernel image.
pub(crate) fn detect_boot_files(root: &Path) -> (Option<String>, Option<String>) {
    let root_kernel = root.join("vmlinuz");
    let root_initrd = root.join("initrd.img");
    if root_kernel.symlink_metadata().is_ok() {
        let initrd = root_initrd
            .symlink_metadata()
            .is_ok()
            .then(|| "/initrd.img".to_string());
        return (Some("/vmlinuz".to_string()), initrd);
    }

    let kernel = newest_with_prefix(&root.join("boot"), "vmlinuz-");
    let initrd = newest_with_prefix(&root.join("boot"), "initrd.img-");
    (
        kernel.map(|name| format!("/boot/{}", name)),
        initrd.map(|name| format!("/boot/{}", name)),
    )
}

fn newest_with_prefix(dir: &Path, prefix: &str) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix))
        .max()
}
