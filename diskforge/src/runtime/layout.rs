//! Runtime home directory layout.
//!
//! ```text
//! <home>/
//!   images/    finished .img artifacts and their manifests
//!   staging/   per-job exported source trees
//!   mounts/    per-job mount points for the build window
//!   logs/      rotated tracing output
//! ```

use crate::job::JobId;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub(crate) struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join("images")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.home_dir.join("staging")
    }

    pub fn mounts_dir(&self) -> PathBuf {
        self.home_dir.join("mounts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn job_staging_dir(&self, id: &JobId) -> PathBuf {
        self.staging_dir().join(id.as_str())
    }

    pub fn job_mount_dir(&self, id: &JobId) -> PathBuf {
        self.mounts_dir().join(id.as_str())
    }

    /// Create the directory tree. Idempotent.
    pub fn prepare(&self) -> io::Result<()> {
        for dir in [
            self.home_dir.clone(),
            self.images_dir(),
            self.staging_dir(),
            self.mounts_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(tmp.path().join("home"));
        layout.prepare().unwrap();

        assert!(layout.images_dir().is_dir());
        assert!(layout.staging_dir().is_dir());
        assert!(layout.mounts_dir().is_dir());
        assert!(layout.logs_dir().is_dir());

        // Second prepare is a no-op.
        layout.prepare().unwrap();
    }

    #[test]
    fn test_job_dirs_are_namespaced_by_id() {
        let layout = FilesystemLayout::new(PathBuf::from("/var/lib/diskforge"));
        let id = JobId::new();
        assert_eq!(
            layout.job_staging_dir(&id),
            layout.staging_dir().join(id.as_str())
        );
        assert_eq!(
            layout.job_mount_dir(&id),
            layout.mounts_dir().join(id.as_str())
        );
    }
}
