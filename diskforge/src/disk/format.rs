//! Filesystem selection and mkfs invocation.

use crate::errors::{DiskforgeError, DiskforgeResult};
use crate::util::process;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;

/// Filesystems the pipeline can lay down on the root partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    #[default]
    Ext4,
}

impl FilesystemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemKind::Ext2 => "ext2",
            FilesystemKind::Ext3 => "ext3",
            FilesystemKind::Ext4 => "ext4",
        }
    }

    pub(crate) fn mkfs_program(&self) -> &'static str {
        match self {
            FilesystemKind::Ext2 => "mkfs.ext2",
            FilesystemKind::Ext3 => "mkfs.ext3",
            FilesystemKind::Ext4 => "mkfs.ext4",
        }
    }
}

impl std::fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FilesystemKind {
    type Err = DiskforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ext2" => Ok(FilesystemKind::Ext2),
            "ext3" => Ok(FilesystemKind::Ext3),
            "ext4" => Ok(FilesystemKind::Ext4),
            other => Err(DiskforgeError::InvalidArgument(format!(
                "unsupported filesystem '{}', expected ext2, ext3 or ext4",
                other
            ))),
        }
    }
}

/// Create the filesystem on a partition device.
///
/// `-q` keeps mke2fs quiet, `-F` skips the "not a block special device"
/// prompt some host configurations raise for loop partitions.
pub(crate) async fn make_filesystem(device: &Path, kind: FilesystemKind) -> DiskforgeResult<()> {
    tracing::info!(
        device = %device.display(),
        filesystem = kind.as_str(),
        "creating filesystem"
    );

    process::run_capture(
        kind.mkfs_program(),
        [OsStr::new("-q"), OsStr::new("-F"), device.as_os_str()],
    )
    .await
    .map_err(|e| match e {
        DiskforgeError::Command {
            program,
            code,
            stderr,
        } => DiskforgeError::Format(format!(
            "{} on {} exited with {:?}: {}",
            program,
            device.display(),
            code,
            stderr
        )),
        other => other,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!(FilesystemKind::from_str("ext2").unwrap(), FilesystemKind::Ext2);
        assert_eq!(FilesystemKind::from_str("EXT3").unwrap(), FilesystemKind::Ext3);
        assert_eq!(FilesystemKind::from_str("ext4").unwrap(), FilesystemKind::Ext4);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = FilesystemKind::from_str("btrfs").unwrap_err();
        assert!(matches!(err, DiskforgeError::InvalidArgument(_)));
        assert!(err.to_string().contains("btrfs"));
    }

    #[test]
    fn test_mkfs_program_names() {
        assert_eq!(FilesystemKind::Ext2.mkfs_program(), "mkfs.ext2");
        assert_eq!(FilesystemKind::Ext4.mkfs_program(), "mkfs.ext4");
    }

    #[test]
    fn test_default_is_ext4() {
        assert_eq!(FilesystemKind::default(), FilesystemKind::Ext4);
    }
}
