//! Sparse image allocation.

use crate::errors::{DiskforgeError, DiskforgeResult};
use std::path::Path;

pub(crate) const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Create the image file at exactly `size_mb` MiB and return its length.
///
/// The file is sparse, so blocks only materialize as the filesystem and
/// contents land. All precondition failures (zero size, taken path,
/// insufficient capacity) surface before anything else in the pipeline has
/// acquired resources.
pub(crate) async fn allocate_image(
    path: &Path,
    size_mb: u64,
    overwrite: bool,
) -> DiskforgeResult<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || allocate_sync(&path, size_mb, overwrite))
        .await
        .map_err(|e| DiskforgeError::Internal(format!("allocation task panicked: {}", e)))?
}

fn allocate_sync(path: &Path, size_mb: u64, overwrite: bool) -> DiskforgeResult<u64> {
    let Some(bytes) = size_mb.checked_mul(BYTES_PER_MIB) else {
        return Err(DiskforgeError::Allocation(format!(
            "requested size {} MiB overflows",
            size_mb
        )));
    };
    if bytes == 0 {
        return Err(DiskforgeError::Allocation(
            "requested size is 0 MiB".to_string(),
        ));
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            DiskforgeError::Allocation(format!("{} has no parent directory", path.display()))
        })?;
    std::fs::create_dir_all(parent)?;

    let available = available_bytes(parent)?;
    if available < bytes {
        return Err(DiskforgeError::Allocation(format!(
            "insufficient capacity under {}: need {} MiB, {} MiB available",
            parent.display(),
            size_mb,
            available / BYTES_PER_MIB
        )));
    }

    let file = if overwrite {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    } else {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
    }
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            DiskforgeError::Allocation(format!(
                "output {} already exists, pass overwrite to replace it",
                path.display()
            ))
        } else {
            DiskforgeError::Allocation(format!("cannot create {}: {}", path.display(), e))
        }
    })?;

    file.set_len(bytes)
        .map_err(|e| DiskforgeError::Allocation(format!("set_len to {} bytes: {}", bytes, e)))?;

    let actual = file.metadata()?.len();
    if actual != bytes {
        return Err(DiskforgeError::Allocation(format!(
            "image is {} bytes, expected {}",
            actual, bytes
        )));
    }

    tracing::info!(
        image = %path.display(),
        size_mb,
        "allocated sparse image"
    );
    Ok(bytes)
}

fn available_bytes(dir: &Path) -> DiskforgeResult<u64> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| DiskforgeError::Internal(format!("path contains NUL: {}", e)))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocates_exact_sparse_size() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("disk.img");

        let bytes = allocate_image(&image, 16, false).await.unwrap();
        assert_eq!(bytes, 16 * BYTES_PER_MIB);
        assert_eq!(std::fs::metadata(&image).unwrap().len(), bytes);
    }

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = allocate_image(&tmp.path().join("zero.img"), 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::Allocation(_)));
    }

    #[tokio::test]
    async fn test_existing_path_rejected_without_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("taken.img");
        std::fs::write(&image, b"old").unwrap();

        let err = allocate_image(&image, 8, false).await.unwrap_err();
        match err {
            DiskforgeError::Allocation(msg) => assert!(msg.contains("already exists")),
            other => panic!("expected Allocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overwrite_replaces_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("replace.img");
        std::fs::write(&image, vec![0xFF; 1024]).unwrap();

        let bytes = allocate_image(&image, 8, true).await.unwrap();
        assert_eq!(std::fs::metadata(&image).unwrap().len(), bytes);
    }

    #[tokio::test]
    async fn test_absurd_size_fails_before_touching_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("huge.img");

        let err = allocate_image(&image, u64::MAX, false).await.unwrap_err();
        assert!(matches!(err, DiskforgeError::Allocation(_)));
        assert!(!image.exists());
    }

    #[tokio::test]
    async fn test_capacity_check_blocks_oversized_request() {
        let tmp = tempfile::tempdir().unwrap();
        let available = available_bytes(tmp.path()).unwrap();
        let too_big_mb = available / BYTES_PER_MIB + 1024;

        let err = allocate_image(&tmp.path().join("big.img"), too_big_mb, false)
            .await
            .unwrap_err();
        match err {
            DiskforgeError::Allocation(msg) => assert!(msg.contains("insufficient capacity")),
            other => panic!("expected Allocation, got {other:?}"),
        }
    }
}
