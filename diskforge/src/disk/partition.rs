//! MBR partition table construction.
//!
//! The layout is fixed: one bootable primary Linux partition (type 0x83)
//! starting at sector 2048 and running to the end of the disk. The table is
//! written by piping a declarative script to sfdisk, which keeps the result
//! byte-identical run to run.

use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::util::process;
use std::path::{Path, PathBuf};

pub(crate) const SECTOR_SIZE: u64 = 512;

/// First partition offset, 1 MiB of alignment headroom.
pub(crate) const FIRST_PARTITION_SECTOR: u64 = 2048;

/// Smallest image that still leaves room for a workable ext filesystem
/// behind the alignment gap.
pub(crate) const MIN_IMAGE_BYTES: u64 = FIRST_PARTITION_SECTOR * SECTOR_SIZE + 8 * 1024 * 1024;

/// Descriptor of the single-partition layout written to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionTable {
    pub start_sector: u64,
    pub sector_count: u64,
    /// 1-based partition number.
    pub index: u32,
}

impl PartitionTable {
    fn for_image(total_bytes: u64) -> DiskforgeResult<Self> {
        if total_bytes < MIN_IMAGE_BYTES {
            return Err(DiskforgeError::Partition(format!(
                "image of {} bytes is below the minimum bootable layout of {} bytes",
                total_bytes, MIN_IMAGE_BYTES
            )));
        }
        Ok(Self {
            start_sector: FIRST_PARTITION_SECTOR,
            sector_count: total_bytes / SECTOR_SIZE - FIRST_PARTITION_SECTOR,
            index: 1,
        })
    }

    /// Device identity the partition has once the image runs as a real
    /// disk. Boot configuration must reference this, never the build-time
    /// loop path.
    pub fn root_device_spec(&self) -> String {
        format!("/dev/sda{}", self.index)
    }

    /// Partition node exposed after `losetup -P` attaches the image.
    pub fn device_on(&self, loop_device: &Path) -> PathBuf {
        let mut name = loop_device.as_os_str().to_os_string();
        name.push(format!("p{}", self.index));
        PathBuf::from(name)
    }

    pub fn size_bytes(&self) -> u64 {
        self.sector_count * SECTOR_SIZE
    }

    fn sfdisk_script(&self) -> String {
        format!(
            "label: dos\nunit: sectors\n\nstart={}, size={}, type=83, bootable\n",
            self.start_sector, self.sector_count
        )
    }
}

/// Write the partition table onto the image file.
pub(crate) async fn partition_image(
    image: &Path,
    total_bytes: u64,
) -> DiskforgeResult<PartitionTable> {
    let table = PartitionTable::for_image(total_bytes)?;

    tracing::info!(
        image = %image.display(),
        start_sector = table.start_sector,
        sectors = table.sector_count,
        "writing partition table"
    );

    process::run_with_stdin("sfdisk", [image.as_os_str()], table.sfdisk_script().as_bytes())
        .await
        .map_err(|e| match e {
            DiskforgeError::Command {
                program,
                code,
                stderr,
            } => DiskforgeError::Partition(format!(
                "{} exited with {:?}: {}",
                program, code, stderr
            )),
            other => other,
        })?;

    Ok(table)
}
