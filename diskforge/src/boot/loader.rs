//! extlinux bootloader installation.
//!
//! The loader is staged into boot/extlinux on the mounted root partition,
//! pointed at the kernel the install stage found. Serial console is always
//! configured so headless VMs get output.

use crate::boot::kernel::KernelOutcome;
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::util::process;
use std::path::Path;

const CONFIG_NAME: &str = "extlinux.conf";
const LOADER_DIR: &str = "boot/extlinux";

/// What goes into extlinux.conf.
#[derive(Debug, Clone)]
pub(crate) struct BootSpec {
    pub kernel: String,
    pub initrd: String,
    /// Kernel-visible root device, e.g. /dev/sda1.
    pub root_device: String,
}

impl BootSpec {
    /// Build a spec from a kernel install outcome. When detection came up
    /// empty the canonical Debian symlink paths are used so the config is
    /// fixable in place after a manual kernel drop-in.
    pub fn new(outcome: &KernelOutcome, root_device: &str) -> Self {
        BootSpec {
            kernel: outcome
                .kernel_path
                .clone()
                .unwrap_or_else(|| "/vmlinuz".to_string()),
            initrd: outcome
                .initrd_path
                .clone()
                .unwrap_or_else(|| "/initrd.img".to_string()),
            root_device: root_device.to_string(),
        }
    }

    /// Render the extlinux.conf contents.
    pub fn render_config(&self) -> String {
        format!(
            "DEFAULT linux\n\
             TIMEOUT 30\n\
             PROMPT 1\n\
             \n\
             LABEL linux\n\
             \x20   MENU LABEL Boot Linux\n\
             \x20   LINUX {kernel}\n\
             \x20   INITRD {initrd}\n\
             \x20   APPEND root={root} rw console=tty0 console=ttyS0,115200n8\n",
            kernel = self.kernel,
            initrd = self.initrd,
            root = self.root_device,
        )
    }
}

/// Install extlinux into the mounted tree and write its config.
///
/// `extlinux --install` stamps the loader into the filesystem, so the
/// partition must still be mounted here. The MBR boot code is separate and
/// goes in after unmount.
pub(crate) async fn install_extlinux(mount_root: &Path, spec: &BootSpec) -> DiskforgeResult<()> {
    let loader_dir = mount_root.join(LOADER_DIR);
    tokio::fs::create_dir_all(&loader_dir)
        .await
        .map_err(|e| DiskforgeError::Bootloader(format!("create {}: {}", LOADER_DIR, e)))?;

    process::run_capture(
        "extlinux",
        [std::ffi::OsStr::new("--install"), loader_dir.as_os_str()],
    )
    .await
    .map_err(|e| match e {
        DiskforgeError::Command {
            program,
            code,
            stderr,
        } => DiskforgeError::Bootloader(format!(
            "{} --install exited with {:?}: {}",
            program, code, stderr
        )),
        other => DiskforgeError::Bootloader(other.to_string()),
    })?;

    let config_path = loader_dir.join(CONFIG_NAME);
    tokio::fs::write(&config_path, spec.render_config())
        .await
        .map_err(|e| DiskforgeError::Bootloader(format!("write {}: {}", CONFIG_NAME, e)))?;

    tracing::info!(
        kernel = %spec.kernel,
        initrd = %spec.initrd,
        root = %spec.root_device,
        "bootloader installed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_config_default_paths() {
        let spec = BootSpec::new(&KernelOutcome::default(), "/dev/sda1");
        let config = spec.render_config();
        assert_eq!(
            config,
            "DEFAULT linux\n\
             TIMEOUT 30\n\
             PROMPT 1\n\
             \n\
             LABEL linux\n\
             \x20   MENU LABEL Boot Linux\n\
             \x20   LINUX /vmlinuz\n\
             \x20   INITRD /initrd.img\n\
             \x20   APPEND root=/dev/sda1 rw console=tty0 console=ttyS0,115200n8\n"
        );
    }

    #[test]
    fn test_render_config_detected_paths() {
        let outcome = KernelOutcome {
            attempted: false,
            installed: true,
            kernel_path: Some("/boot/vmlinuz-6.8.0-41-generic".to_string()),
            initrd_path: Some("/boot/initrd.img-6.8.0-41-generic".to_string()),
        };
        let spec = BootSpec::new(&outcome, "/dev/sda1");
        let config = spec.render_config();
        assert!(config.contains("    LINUX /boot/vmlinuz-6.8.0-41-generic\n"));
        assert!(config.contains("    INITRD /boot/initrd.img-6.8.0-41-generic\n"));
        assert!(config.contains("APPEND root=/dev/sda1 rw"));
    }

    #[test]
    fn test_render_config_serial_console() {
        let spec = BootSpec::new(&KernelOutcome::default(), "/dev/sda1");
        assert!(
            spec.render_config()
                .contains("console=tty0 console=ttyS0,115200n8")
        );
    }
}
