//! Finished image bookkeeping.
//!
//! Every finished image gets a sidecar manifest recording what went into
//! it and its digest. Listing and cleanup operate on the runtime images
//! directory.

use crate::boot::DistroFamily;
use crate::disk::FilesystemKind;
use crate::errors::{DiskforgeError, DiskforgeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const MANIFEST_SUFFIX: &str = ".manifest.json";
const IMAGE_EXTENSION: &str = "img";

/// Sidecar record written next to a finished image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub source_ref: String,
    pub disk_size_mb: u64,
    pub filesystem_type: FilesystemKind,
    pub distro_family: DistroFamily,
    pub kernel_installed: bool,
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

/// One image in the images directory.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEntry {
    pub filename: String,
    pub path: PathBuf,
    pub size_mb: u64,
}

pub(crate) fn manifest_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

/// Hex SHA-256 of a file, streaming so multi-GiB images stay cheap.
pub(crate) async fn sha256_file(path: &Path) -> DiskforgeResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| DiskforgeError::Internal(format!("digest task panicked: {}", e)))?
}

pub(crate) async fn write_manifest(
    image: &Path,
    manifest: &ArtifactManifest,
) -> DiskforgeResult<()> {
    let path = manifest_path(image);
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| DiskforgeError::Internal(format!("encode manifest: {}", e)))?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), "manifest written");
    Ok(())
}

/// All `.img` files in the images directory, sorted by filename.
pub(crate) async fn list_images(images_dir: &Path) -> DiskforgeResult<Vec<ArtifactEntry>> {
    let mut entries = Vec::new();

    let mut dir = match tokio::fs::read_dir(images_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(IMAGE_EXTENSION) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        entries.push(ArtifactEntry {
            filename,
            path,
            size_mb: meta.len() / (1024 * 1024),
        });
    }

    entries.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(entries)
}

/// Remove every file under the images directory and recreate it empty.
///
/// Returns the number of images removed; manifests and stray files go
/// with them but do not count. Idempotent: a missing directory counts as
/// zero and still ends up existing.
pub(crate) async fn cleanup_images(images_dir: &Path) -> DiskforgeResult<u64> {
    let mut removed = 0u64;

    match tokio::fs::read_dir(images_dir).await {
        Ok(mut dir) => {
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(IMAGE_EXTENSION)
                    && entry.metadata().await?.is_file()
                {
                    removed += 1;
                }
            }
            tokio::fs::remove_dir_all(images_dir).await?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    tokio::fs::create_dir_all(images_dir).await?;
    tracing::info!(
        dir = %images_dir.display(),
        removed = removed,
        "images directory cleaned"
    );
    Ok(removed)
}
