//! Source export boundary.
//!
//! The container runtime that produces an exported filesystem is outside
//! this crate; `SourceProvider` is the seam it plugs into. The built-in
//! `LocalSource` covers the two shapes an export arrives in on disk: an
//! already-unpacked tree, or a `docker export` style tarball.

use crate::errors::{DiskforgeError, DiskforgeResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Produces the filesystem tree a conversion consumes.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Materialize `source_ref` under `staging_dir` and return the tree
    /// root. Implementations must never modify the tree after returning.
    async fn export(&self, source_ref: &str, staging_dir: &Path) -> DiskforgeResult<PathBuf>;
}

/// Filesystem-local provider: directories pass through, tarballs unpack
/// into staging with ownership, permissions, and mtimes preserved.
#[derive(Debug, Default, Clone)]
pub struct LocalSource;

#[async_trait]
impl SourceProvider for LocalSource {
    async fn export(&self, source_ref: &str, staging_dir: &Path) -> DiskforgeResult<PathBuf> {
        let source = PathBuf::from(source_ref);

        if source.is_dir() {
            tracing::debug!(source = %source.display(), "using exported tree in place");
            return Ok(source);
        }

        if source.is_file() {
            let kind = ArchiveKind::of(&source).ok_or_else(|| {
                DiskforgeError::Source(format!(
                    "{} is not a tar or tar.gz archive",
                    source.display()
                ))
            })?;

            let root = staging_dir.join("rootfs");
            tokio::fs::create_dir_all(&root).await?;

            let unpack_root = root.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&source, &unpack_root, kind))
                .await
                .map_err(|e| DiskforgeError::Internal(format!("unpack task panicked: {}", e)))??;
            return Ok(root);
        }

        Err(DiskforgeError::Source(format!(
            "source ref '{}' is neither a directory nor an archive file",
            source_ref
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Tar,
    TarGz,
}

impl ArchiveKind {
    fn of(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

fn unpack_archive(archive: &Path, target: &Path, kind: ArchiveKind) -> DiskforgeResult<()> {
    let file = std::fs::File::open(archive)
        .map_err(|e| DiskforgeError::Source(format!("open {}: {}", archive.display(), e)))?;

    let result = match kind {
        ArchiveKind::Tar => unpack_stream(file, target),
        ArchiveKind::TarGz => unpack_stream(flate2::read::GzDecoder::new(file), target),
    };

    result.map_err(|e| {
        DiskforgeError::Source(format!("unpack {}: {}", archive.display(), e))
    })?;

    tracing::info!(
        archive = %archive.display(),
        target = %target.display(),
        "source archive unpacked"
    );
    Ok(())
}

fn unpack_stream<R: std::io::Read>(reader: R, target: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(preserve_ownership());
    archive.set_preserve_permissions(true);
    archive.unpack(target)
}

/// chown during unpack only works as root; without it the entries land
/// owned by the current user, which is what unprivileged callers expect.
fn preserve_ownership() -> bool {
    unsafe { libc::geteuid() == 0 }
}
