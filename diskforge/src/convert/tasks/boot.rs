//! Tasks: Kernel install and bootloader setup.
//!
//! Kernel installation is best-effort: a failure degrades the job with a
//! warning instead of failing it, since the populated image is still
//! useful as a disk. Bootloader installation is not negotiable; without
//! it the artifact has no reason to exist.

use super::{ConvertCtx, log_task_error, stage_start};
use crate::boot::kernel::{self, KernelInstallPlan};
use crate::boot::loader::{self, BootSpec};
use crate::boot::{DistroFamily, KernelOutcome};
use crate::disk::mount;
use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::guard::Resource;
use crate::job::JobStage;
use crate::pipeline::PipelineTask;
use crate::rootfs;
use async_trait::async_trait;
use std::path::Path;

/// Host directories bound into the tree for the chroot window.
const BIND_DIRS: [&str; 3] = ["dev", "proc", "sys"];

pub struct KernelInstallTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for KernelInstallTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::InstallingKernel).await?;

        let mount_point = {
            let ctx = ctx.lock().await;
            ctx.mount_point.clone().ok_or_else(|| {
                DiskforgeError::Internal("kernel install before mount".to_string())
            })?
        };

        let family = DistroFamily::detect(&mount_point);
        tracing::info!(
            job_id = %job_id,
            family = family.as_str(),
            "detected root filesystem family"
        );

        {
            let mut ctx = ctx.lock().await;
            ctx.distro = Some(family);
            ctx.runtime.jobs.set_distro(&job_id, family)?;
        }

        let mut attempted = false;
        match KernelInstallPlan::for_family(family) {
            KernelInstallPlan::DebianChroot => {
                attempted = true;
                if let Err(e) = chroot_install(&ctx, &mount_point).await {
                    if e.is_fatal() {
                        log_task_error(&job_id, task_name, &e);
                        return Err(e);
                    }
                    let warning = format!(
                        "kernel install failed ({}), continuing with the tree as shipped",
                        e
                    );
                    let mut ctx = ctx.lock().await;
                    ctx.runtime.jobs.push_warning(&job_id, warning.clone())?;
                    ctx.notes.push(warning);
                }
            }
            KernelInstallPlan::Skip => {
                let warning = format!(
                    "no kernel installer for {} trees, kernel install skipped",
                    family
                );
                let mut ctx = ctx.lock().await;
                ctx.runtime.jobs.push_warning(&job_id, warning.clone())?;
                ctx.notes.push(warning);
            }
        }

        // Trees without an init get the minimal shell fallback so the
        // image reaches a prompt.
        let wrote_init = rootfs::ensure_init(&mount_point)
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;
        if wrote_init {
            let warning = "no init in tree, wrote minimal fallback init".to_string();
            let mut ctx = ctx.lock().await;
            ctx.runtime.jobs.push_warning(&job_id, warning.clone())?;
            ctx.notes.push(warning);
        }

        let (kernel_path, initrd_path) = kernel::detect_boot_files(&mount_point);
        let installed = kernel_path.is_some();
        if !installed {
            let warning =
                "no kernel image in tree, image will not boot until one is added".to_string();
            let mut ctx = ctx.lock().await;
            ctx.runtime.jobs.push_warning(&job_id, warning.clone())?;
            ctx.notes.push(warning);
        }

        let mut ctx = ctx.lock().await;
        ctx.kernel = Some(KernelOutcome {
            attempted,
            installed,
            kernel_path,
            initrd_path,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "install_kernel"
    }
}

/// Bind /dev, /proc, /sys into the tree, run the chroot install, and tear
/// the binds down whatever happened.
async fn chroot_install(ctx: &ConvertCtx, root: &Path) -> DiskforgeResult<()> {
    let handles = {
        let mut ctx = ctx.lock().await;
        BIND_DIRS.map(|name| ctx.guard.push(Resource::BindMount(root.join(name))))
    };

    let mut bound = Ok(());
    for name in BIND_DIRS {
        if let Err(e) = mount::bind_mount(&Path::new("/").join(name), &root.join(name)) {
            bound = Err(e);
            break;
        }
    }

    let result = match bound {
        Ok(()) => kernel::run_debian_chroot_install(root).await,
        Err(e) => Err(e),
    };

    {
        let mut ctx = ctx.lock().await;
        for handle in handles.into_iter().rev() {
            ctx.guard.release(handle).await;
        }
    }

    result
}

pub struct BootloaderTask;

#[async_trait]
impl PipelineTask<ConvertCtx> for BootloaderTask {
    async fn run(self: Box<Self>, ctx: ConvertCtx) -> DiskforgeResult<()> {
        let task_name = self.name();
        let job_id = stage_start(&ctx, JobStage::InstallingBootloader).await?;

        let (mount_point, root_device, outcome) = {
            let ctx = ctx.lock().await;
            let mount = ctx.mount_point.clone().ok_or_else(|| {
                DiskforgeError::Internal("bootloader install before mount".to_string())
            })?;
            let table = ctx.table.as_ref().ok_or_else(|| {
                DiskforgeError::Internal("bootloader install before partitioning".to_string())
            })?;
            let outcome = ctx.kernel.clone().ok_or_else(|| {
                DiskforgeError::Internal("bootloader install before kernel stage".to_string())
            })?;
            (mount, table.root_device_spec(), outcome)
        };

        let boot_spec = BootSpec::new(&outcome, &root_device);
        loader::install_extlinux(&mount_point, &boot_spec)
            .await
            .inspect_err(|e| log_task_error(&job_id, task_name, e))?;

        Ok(())
    }

    fn name(&self) -> &str {
        "install_bootloader"
    }
}
