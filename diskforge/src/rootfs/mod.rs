//! Content population.
//!
//! Replicates an exported tree into the mounted filesystem. Symlinks are
//! recreated as links and never followed, so a hostile link target cannot
//! route writes outside either tree. Modes, ownership, mtimes, hardlinks,
//! and device nodes all carry over; directory mtimes are applied after
//! their contents so the copy itself does not disturb them.

use crate::errors::{DiskforgeError, DiskforgeResult};
use filetime::FileTime;
use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt, chown, lchown, symlink};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Shell init written when a tree has no init of its own, so the image
/// still boots to a shell.
const FALLBACK_INIT: &str = "#!/bin/sh\n\
mount -t proc proc /proc\n\
mount -t sysfs sysfs /sys\n\
mount -t devtmpfs devtmpfs /dev\n\
echo \"Container-based Linux system booted successfully!\"\n\
/bin/sh\n";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PopulateStats {
    pub dirs: u64,
    pub files: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub specials: u64,
    pub bytes: u64,
}

impl PopulateStats {
    pub fn entries(&self) -> u64 {
        self.dirs + self.files + self.symlinks + self.hardlinks + self.specials
    }
}

/// Copy the source tree into `target`, preserving metadata.
pub(crate) async fn populate(source: &Path, target: &Path) -> DiskforgeResult<PopulateStats> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&source, &target))
        .await
        .map_err(|e| DiskforgeError::Internal(format!("populate task panicked: {}", e)))?
}

fn copy_tree(source: &Path, target: &Path) -> DiskforgeResult<PopulateStats> {
    let mut stats = PopulateStats::default();
    // Inode map so multiply-linked files stay hardlinks instead of
    // exploding into copies.
    let mut inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut dir_times: Vec<(PathBuf, FileTime, FileTime)> = Vec::new();

    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source.to_path_buf());
            pop_err(&path, &e.to_string())
        })?;

        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| DiskforgeError::Internal(format!("walk escaped source root: {}", e)))?;
        let dest = target.join(rel);

        let meta = entry
            .metadata()
            .map_err(|e| pop_err(entry.path(), &e.to_string()))?;
        let ftype = meta.file_type();

        let step = if ftype.is_dir() {
            copy_dir(&dest, &meta, &mut dir_times)
        } else if ftype.is_symlink() {
            copy_symlink(entry.path(), &dest, &meta)
        } else if ftype.is_file() {
            copy_file(entry.path(), &dest, &meta, &mut inodes, &mut stats)
        } else {
            copy_special(&dest, &meta)
        };
        step.map_err(|e| pop_err(entry.path(), &e.to_string()))?;

        if ftype.is_dir() {
            stats.dirs += 1;
        } else if ftype.is_symlink() {
            stats.symlinks += 1;
        } else if !ftype.is_file() {
            stats.specials += 1;
        }
    }

    // Children are in place, restore directory mtimes deepest-first.
    for (path, atime, mtime) in dir_times.iter().rev() {
        filetime::set_file_times(path, *atime, *mtime)
            .map_err(|e| pop_err(path, &e.to_string()))?;
    }

    // The mount point takes the source root's identity.
    let root_meta = std::fs::metadata(source).map_err(|e| pop_err(source, &e.to_string()))?;
    apply_owner_and_mode(target, &root_meta).map_err(|e| pop_err(source, &e.to_string()))?;
    filetime::set_file_times(
        target,
        FileTime::from_last_access_time(&root_meta),
        FileTime::from_last_modification_time(&root_meta),
    )
    .map_err(|e| pop_err(source, &e.to_string()))?;

    tracing::info!(
        dirs = stats.dirs,
        files = stats.files,
        symlinks = stats.symlinks,
        hardlinks = stats.hardlinks,
        specials = stats.specials,
        bytes = stats.bytes,
        "tree populated"
    );
    Ok(stats)
}

fn copy_dir(
    dest: &Path,
    meta: &std::fs::Metadata,
    dir_times: &mut Vec<(PathBuf, FileTime, FileTime)>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    apply_owner_and_mode(dest, meta)?;
    dir_times.push((
        dest.to_path_buf(),
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    ));
    Ok(())
}

fn copy_symlink(src: &Path, dest: &Path, meta: &std::fs::Metadata) -> std::io::Result<()> {
    // Target string copied verbatim, absolute or not. It is resolved by
    // the booted system, never by us.
    let link_target = std::fs::read_link(src)?;
    symlink(&link_target, dest)?;
    lchown(dest, Some(meta.uid()), Some(meta.gid()))?;
    filetime::set_symlink_file_times(
        dest,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )
}

fn copy_file(
    src: &Path,
    dest: &Path,
    meta: &std::fs::Metadata,
    inodes: &mut HashMap<(u64, u64), PathBuf>,
    stats: &mut PopulateStats,
) -> std::io::Result<()> {
    if meta.nlink() > 1 {
        let key = (meta.dev(), meta.ino());
        if let Some(existing) = inodes.get(&key) {
            std::fs::hard_link(existing, dest)?;
            stats.hardlinks += 1;
            return Ok(());
        }
        inodes.insert(key, dest.to_path_buf());
    }

    std::fs::copy(src, dest)?;
    // chown drops setuid/setgid, so the mode goes on afterwards.
    apply_owner_and_mode(dest, meta)?;
    filetime::set_file_times(
        dest,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )?;
    stats.files += 1;
    stats.bytes += meta.len();
    Ok(())
}

/// Device nodes, FIFOs, and sockets via mknod(2). Needs root for device
/// nodes, as does the surrounding loop device workflow.
fn copy_special(dest: &Path, meta: &std::fs::Metadata) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(dest.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let rc = unsafe {
        libc::mknod(
            cpath.as_ptr(),
            meta.mode() as libc::mode_t,
            meta.rdev() as libc::dev_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    apply_owner_and_mode(dest, meta)?;
    filetime::set_file_times(
        dest,
        FileTime::from_last_access_time(meta),
        FileTime::from_last_modification_time(meta),
    )
}

fn apply_owner_and_mode(path: &Path, meta: &std::fs::Metadata) -> std::io::Result<()> {
    chown(path, Some(meta.uid()), Some(meta.gid()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
}

fn pop_err(path: &Path, reason: &str) -> DiskforgeError {
    DiskforgeError::Population {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Write the fallback init if the tree has none.
///
/// Returns true when the script was written. A dangling symlink at
/// sbin/init counts as present and is left alone.
pub(crate) fn ensure_init(root: &Path) -> DiskforgeResult<bool> {
    let sbin_init = root.join("sbin/init");
    let has_init = sbin_init.symlink_metadata().is_ok()
        || root.join("init").symlink_metadata().is_ok();
    if has_init {
        return Ok(false);
    }

    let write = || -> std::io::Result<()> {
        std::fs::create_dir_all(root.join("sbin"))?;
        std::fs::write(&sbin_init, FALLBACK_INIT)?;
        std::fs::set_permissions(&sbin_init, std::fs::Permissions::from_mode(0o755))
    };
    write().map_err(|e| pop_err(&sbin_init, &e.to_string()))?;

    tracing::info!(path = %sbin_init.display(), "wrote fallback init script");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    fn build_source() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("etc/deep")).unwrap();
        std::fs::write(src.join("etc/hostname"), b"forge\n").unwrap();
        std::fs::set_permissions(
            src.join("etc/hostname"),
            std::fs::Permissions::from_mode(0o640),
        )
        .unwrap();
        std::fs::set_permissions(src.join("etc/deep"), std::fs::Permissions::from_mode(0o750))
            .unwrap();
        symlink("hostname", src.join("etc/alias")).unwrap();
        symlink("/absolute/elsewhere", src.join("etc/rooted")).unwrap();
        (tmp, src)
    }

    #[tokio::test]
    async fn test_populate_preserves_structure_and_modes() {
        let (tmp, src) = build_source();
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();

        let stats = populate(&src, &dst).await.unwrap();
        assert_eq!(stats.dirs, 2);
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symlinks, 2);

        assert_eq!(
            std::fs::read_to_string(dst.join("etc/hostname")).unwrap(),
            "forge\n"
        );
        let mode = std::fs::metadata(dst.join("etc/hostname"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
        let dir_mode = std::fs::metadata(dst.join("etc/deep"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn test_symlinks_copied_verbatim_not_followed() {
        let (tmp, src) = build_source();
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();

        populate(&src, &dst).await.unwrap();

        assert_eq!(
            std::fs::read_link(dst.join("etc/alias")).unwrap(),
            PathBuf::from("hostname")
        );
        // Absolute target is stored as-is; nothing was written outside dst.
        assert_eq!(
            std::fs::read_link(dst.join("etc/rooted")).unwrap(),
            PathBuf::from("/absolute/elsewhere")
        );
        assert!(
            dst.join("etc/rooted").symlink_metadata().unwrap().file_type().is_symlink()
        );
    }

    #[tokio::test]
    async fn test_mtimes_preserved() {
        let (tmp, src) = build_source();
        let stamp = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(src.join("etc/hostname"), stamp).unwrap();
        filetime::set_file_mtime(src.join("etc/deep"), stamp).unwrap();

        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        populate(&src, &dst).await.unwrap();

        let file_meta = std::fs::metadata(dst.join("etc/hostname")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&file_meta), stamp);
        let dir_meta = std::fs::metadata(dst.join("etc/deep")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&dir_meta), stamp);
    }

    #[tokio::test]
    async fn test_hardlinks_stay_linked() {
        let (tmp, src) = build_source();
        std::fs::hard_link(src.join("etc/hostname"), src.join("etc/hostname.link")).unwrap();

        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        let stats = populate(&src, &dst).await.unwrap();
        assert_eq!(stats.hardlinks, 1);

        let a = std::fs::metadata(dst.join("etc/hostname")).unwrap();
        let b = std::fs::metadata(dst.join("etc/hostname.link")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[tokio::test]
    async fn test_fifo_recreated() {
        use std::os::unix::ffi::OsStrExt;

        let (tmp, src) = build_source();
        let fifo = src.join("etc/queue");
        let cpath = std::ffi::CString::new(fifo.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) }, 0);

        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();
        let stats = populate(&src, &dst).await.unwrap();
        assert_eq!(stats.specials, 1);
        assert!(
            std::fs::metadata(dst.join("etc/queue"))
                .unwrap()
                .file_type()
                .is_fifo()
        );
    }

    #[tokio::test]
    async fn test_empty_source_tree_is_valid() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("empty");
        std::fs::create_dir(&src).unwrap();
        let dst = tmp.path().join("dst");
        std::fs::create_dir(&dst).unwrap();

        let stats = populate(&src, &dst).await.unwrap();
        assert_eq!(stats.entries(), 0);
    }

    #[test]
    fn test_ensure_init_writes_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ensure_init(tmp.path()).unwrap());

        let script = tmp.path().join("sbin/init");
        let content = std::fs::read_to_string(&script).unwrap();
        assert!(content.starts_with("#!/bin/sh"));
        assert!(content.contains("devtmpfs"));
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // Second call sees the init and leaves it alone.
        assert!(!ensure_init(tmp.path()).unwrap());
    }

    #[test]
    fn test_ensure_init_respects_existing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sbin")).unwrap();
        std::fs::write(tmp.path().join("sbin/init"), b"real init").unwrap();

        assert!(!ensure_init(tmp.path()).unwrap());
        assert_eq!(
            std::fs::read(tmp.path().join("sbin/init")).unwrap(),
            b"real init"
        );
    }
}
