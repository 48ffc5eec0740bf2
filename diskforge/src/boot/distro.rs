//! Distro family detection.
//!
//! Families are recognized from marker files in the populated tree. The
//! set is closed: anything without a marker is `Unknown` and gets no
//! kernel installer, never a guess.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistroFamily {
    Debian,
    Alpine,
    Unknown,
}

impl DistroFamily {
    pub(crate) fn detect(root: &Path) -> Self {
        if root.join("etc/debian_version").exists() || root.join("etc/apt/sources.list").exists()
        {
            DistroFamily::Debian
        } else if root.join("etc/alpine-release").exists() {
            DistroFamily::Alpine
        } else {
            DistroFamily::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistroFamily::Debian => "debian",
            DistroFamily::Alpine => "alpine",
            DistroFamily::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DistroFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_debian_by_version_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/debian_version"), b"12.5\n").unwrap();
        assert_eq!(DistroFamily::detect(tmp.path()), DistroFamily::Debian);
    }

    #[test]
    fn test_detect_debian_by_apt_sources() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc/apt")).unwrap();
        std::fs::write(tmp.path().join("etc/apt/sources.list"), b"deb ...\n").unwrap();
        assert_eq!(DistroFamily::detect(tmp.path()), DistroFamily::Debian);
    }

    #[test]
    fn test_detect_alpine() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/alpine-release"), b"3.20.0\n").unwrap();
        assert_eq!(DistroFamily::detect(tmp.path()), DistroFamily::Alpine);
    }

    #[test]
    fn test_detect_unknown_without_markers() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(DistroFamily::detect(tmp.path()), DistroFamily::Unknown);
    }

    #[test]
    fn test_debian_marker_wins_over_alpine() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/debian_version"), b"12\n").unwrap();
        std::fs::write(tmp.path().join("etc/alpine-release"), b"3.20\n").unwrap();
        assert_eq!(DistroFamily::detect(tmp.path()), DistroFamily::Debian);
    }
}
