//! MBR boot sector finishing.
//!
//! The syslinux MBR blob carries the stage-one boot code that jumps into
//! extlinux on the active partition. It is written directly into the image
//! file after the loop device is gone, so nothing else can be racing the
//! first sector.

use crate::errors::{DiskforgeError, DiskforgeResult};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Bytes 0..440 of sector zero. The partition table starts right after
/// the disk signature and must not be touched.
const BOOT_CODE_SIZE: u64 = 440;
/// Status byte of the first partition entry.
const BOOT_FLAG_OFFSET: u64 = 446;
const SIGNATURE_OFFSET: u64 = 510;

const ACTIVE_FLAG: u8 = 0x80;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Write the syslinux boot code into the image and make sector zero
/// bootable.
///
/// The partition table and disk signature written by the partitioner are
/// preserved. The active flag and 0x55AA signature are normally already in
/// place from sfdisk; they are re-asserted here so the image boots even if
/// the partitioner left them out.
pub(crate) fn write_boot_sector(image: &Path, mbr_bin: &Path) -> DiskforgeResult<()> {
    let code = std::fs::read(mbr_bin).map_err(|e| {
        DiskforgeError::Bootloader(format!("read MBR blob {}: {}", mbr_bin.display(), e))
    })?;
    if code.is_empty() || code.len() as u64 > BOOT_CODE_SIZE {
        return Err(DiskforgeError::Bootloader(format!(
            "MBR blob {} is {} bytes, expected 1..={}",
            mbr_bin.display(),
            code.len(),
            BOOT_CODE_SIZE
        )));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .map_err(|e| {
            DiskforgeError::Bootloader(format!("open image {}: {}", image.display(), e))
        })?;
    let len = file
        .metadata()
        .map_err(|e| DiskforgeError::Bootloader(format!("stat image: {}", e)))?
        .len();
    if len < SIGNATURE_OFFSET + 2 {
        return Err(DiskforgeError::Bootloader(format!(
            "image {} is {} bytes, too small to hold a boot sector",
            image.display(),
            len
        )));
    }

    file.write_all_at(&code, 0)
        .map_err(|e| DiskforgeError::Bootloader(format!("write boot code: {}", e)))?;

    let mut flag = [0u8; 1];
    file.read_exact_at(&mut flag, BOOT_FLAG_OFFSET)
        .map_err(|e| DiskforgeError::Bootloader(format!("read partition flag: {}", e)))?;
    if flag[0] != ACTIVE_FLAG {
        file.write_all_at(&[ACTIVE_FLAG], BOOT_FLAG_OFFSET)
            .map_err(|e| DiskforgeError::Bootloader(format!("set partition flag: {}", e)))?;
    }

    let mut sig = [0u8; 2];
    file.read_exact_at(&mut sig, SIGNATURE_OFFSET)
        .map_err(|e| DiskforgeError::Bootloader(format!("read MBR signature: {}", e)))?;
    if sig != MBR_SIGNATURE {
        file.write_all_at(&MBR_SIGNATURE, SIGNATURE_OFFSET)
            .map_err(|e| DiskforgeError::Bootloader(format!("set MBR signature: {}", e)))?;
    }

    file.sync_all()
        .map_err(|e| DiskforgeError::Bootloader(format!("sync image: {}", e)))?;

    tracing::info!(
        image = %image.display(),
        code_bytes = code.len(),
        "boot sector written"
    );
    Ok(())
}
