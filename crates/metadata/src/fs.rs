//! Filesystem back-end contract and the local implementation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;
use tracing::debug;

use crate::attrs::{FileAttrs, FileType, Group, User};

/// Back-end failure, tagged with the operation and path for diagnostics.
#[derive(Debug, Error)]
#[error("{op} {path:?}: {source}")]
pub struct FsError {
    /// Operation that failed, e.g. `"stat"`.
    pub op: &'static str,
    /// Path the operation targeted.
    pub path: PathBuf,
    /// Underlying I/O error.
    #[source]
    pub source: io::Error,
}

impl FsError {
    fn new(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns `true` when the target vanished between listing and use.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Operations the transfer engine needs from the local machine.
///
/// All paths are absolute by the time they reach the back-end; relative-path
/// validation happens in the file-list layer.
pub trait Filesystem {
    /// Attributes of `path` without following symlinks.
    fn stat(&self, path: &Path) -> Result<FileAttrs, FsError>;

    /// Like [`Filesystem::stat`], mapping "not found" to `None`.
    fn stat_if_exists(&self, path: &Path) -> Result<Option<FileAttrs>, FsError>;

    /// Directory entries as `(name, attrs)` pairs, unsorted.
    fn read_dir(&self, path: &Path) -> Result<Vec<(std::ffi::OsString, FileAttrs)>, FsError>;

    /// Creates a directory; succeeding when it already exists.
    fn create_dir(&self, path: &Path) -> Result<(), FsError>;

    /// Creates or replaces a symlink at `path` pointing at `target`.
    fn make_symlink(&self, path: &Path, target: &Path) -> Result<(), FsError>;

    /// Raw bytes of a symlink's target.
    fn read_link_target(&self, path: &Path) -> Result<Vec<u8>, FsError>;

    /// Sets permission bits.
    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError>;

    /// Sets the modification time in whole seconds.
    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<(), FsError>;

    /// Changes ownership. `None` leaves that id untouched. May clear
    /// setuid/setgid bits as a side effect of the underlying call.
    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError>;

    /// Local uid for an account name; `None` when the name is unknown here.
    fn uid_for_name(&self, name: &str) -> Option<u32>;

    /// Local gid for a group name; `None` when the name is unknown here.
    fn gid_for_name(&self, name: &str) -> Option<u32>;

    /// Renames `src` over `dst`. Returns `false` when the rename could not
    /// be performed atomically (for example across filesystems), leaving
    /// `src` in place.
    fn atomic_move(&self, src: &Path, dst: &Path) -> Result<bool, FsError>;

    /// Removes a file, or a directory tree recursively.
    fn unlink_recursive(&self, path: &Path) -> Result<(), FsError>;
}

/// [`Filesystem`] backed by the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    /// Creates the back-end. A value rather than a global so it can be
    /// threaded through constructors.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn attrs_from_metadata(meta: &fs::Metadata) -> FileAttrs {
    use std::os::unix::fs::MetadataExt;

    let rdev = meta.rdev();
    let file_type = FileType::from_mode(meta.mode());
    let (major, minor) = if file_type.is_device() {
        (
            nix::sys::stat::major(rdev) as u32,
            nix::sys::stat::minor(rdev) as u32,
        )
    } else {
        (0, 0)
    };

    FileAttrs {
        mode: meta.mode(),
        size: if file_type == FileType::Regular { meta.size() } else { 0 },
        mtime: meta.mtime().max(0),
        user: User::from_uid(meta.uid()),
        group: Group::from_gid(meta.gid()),
        rdev_major: major,
        rdev_minor: minor,
        nlink: meta.nlink(),
        file_id: Some((meta.dev(), meta.ino())),
    }
}

#[cfg(not(unix))]
fn attrs_from_metadata(meta: &fs::Metadata) -> FileAttrs {
    let (type_bits, perms) = if meta.is_dir() {
        (FileType::Directory.mode_bits(), 0o755)
    } else if meta.file_type().is_symlink() {
        (FileType::Symlink.mode_bits(), 0o777)
    } else {
        (FileType::Regular.mode_bits(), 0o644)
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);

    FileAttrs {
        mode: type_bits | perms,
        size: if meta.is_file() { meta.len() } else { 0 },
        mtime,
        user: User::default(),
        group: Group::default(),
        rdev_major: 0,
        rdev_minor: 0,
        nlink: 1,
        file_id: None,
    }
}

impl Filesystem for LocalFilesystem {
    fn stat(&self, path: &Path) -> Result<FileAttrs, FsError> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::new("stat", path, e))?;
        Ok(attrs_from_metadata(&meta))
    }

    fn stat_if_exists(&self, path: &Path) -> Result<Option<FileAttrs>, FsError> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(attrs_from_metadata(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FsError::new("stat", path, e)),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<(std::ffi::OsString, FileAttrs)>, FsError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| FsError::new("opendir", path, e))? {
            let entry = entry.map_err(|e| FsError::new("readdir", path, e))?;
            match fs::symlink_metadata(entry.path()) {
                Ok(meta) => entries.push((entry.file_name(), attrs_from_metadata(&meta))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Entry vanished between readdir and stat; drop it.
                    debug!(path = %entry.path().display(), "entry vanished during walk");
                }
                Err(e) => return Err(FsError::new("stat", &entry.path(), e)),
            }
        }
        Ok(entries)
    }

    fn create_dir(&self, path: &Path) -> Result<(), FsError> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(FsError::new("mkdir", path, e)),
        }
    }

    #[cfg(unix)]
    fn make_symlink(&self, path: &Path, target: &Path) -> Result<(), FsError> {
        if fs::symlink_metadata(path).is_ok() {
            fs::remove_file(path).map_err(|e| FsError::new("unlink", path, e))?;
        }
        std::os::unix::fs::symlink(target, path).map_err(|e| FsError::new("symlink", path, e))
    }

    #[cfg(not(unix))]
    fn make_symlink(&self, path: &Path, _target: &Path) -> Result<(), FsError> {
        Err(FsError::new(
            "symlink",
            path,
            io::Error::new(io::ErrorKind::Unsupported, "symlinks require unix"),
        ))
    }

    fn read_link_target(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        let target = fs::read_link(path).map_err(|e| FsError::new("readlink", path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            Ok(target.as_os_str().as_bytes().to_vec())
        }
        #[cfg(not(unix))]
        {
            Ok(target.to_string_lossy().into_owned().into_bytes())
        }
    }

    #[cfg(unix)]
    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| FsError::new("chmod", path, e))
    }

    #[cfg(not(unix))]
    fn set_mode(&self, _path: &Path, _mode: u32) -> Result<(), FsError> {
        Ok(())
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<(), FsError> {
        filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0))
            .map_err(|e| FsError::new("utimes", path, e))
    }

    #[cfg(unix)]
    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError> {
        use nix::unistd::{chown, Gid, Uid};
        chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
            .map_err(|e| FsError::new("chown", path, io::Error::from(e)))
    }

    #[cfg(not(unix))]
    fn set_owner(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<(), FsError> {
        Ok(())
    }

    #[cfg(unix)]
    fn uid_for_name(&self, name: &str) -> Option<u32> {
        match nix::unistd::User::from_name(name) {
            Ok(user) => user.map(|u| u.uid.as_raw()),
            Err(e) => {
                debug!(name, error = %e, "uid lookup failed");
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn uid_for_name(&self, _name: &str) -> Option<u32> {
        None
    }

    #[cfg(unix)]
    fn gid_for_name(&self, name: &str) -> Option<u32> {
        match nix::unistd::Group::from_name(name) {
            Ok(group) => group.map(|g| g.gid.as_raw()),
            Err(e) => {
                debug!(name, error = %e, "gid lookup failed");
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn gid_for_name(&self, _name: &str) -> Option<u32> {
        None
    }

    fn atomic_move(&self, src: &Path, dst: &Path) -> Result<bool, FsError> {
        match fs::rename(src, dst) {
            Ok(()) => Ok(true),
            // 18 is EXDEV on every unix; the caller falls back to a copy.
            Err(e) if e.raw_os_error() == Some(18) => Ok(false),
            Err(e) => Err(FsError::new("rename", src, e)),
        }
    }

    fn unlink_recursive(&self, path: &Path) -> Result<(), FsError> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::new("stat", path, e))?;
        if meta.is_dir() {
            fs::remove_dir_all(path).map_err(|e| FsError::new("rmdir", path, e))
        } else {
            fs::remove_file(path).map_err(|e| FsError::new("unlink", path, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stat_reports_regular_file_attrs() {
        let temp = TempDir::new().expect("create tempdir");
        let path = temp.path().join("file.txt");
        fs::write(&path, b"hello").expect("write file");

        let fs_backend = LocalFilesystem::new();
        let attrs = fs_backend.stat(&path).expect("stat succeeds");
        assert!(attrs.is_regular());
        assert_eq!(attrs.size, 5);
        assert!(attrs.mtime > 0);
    }

    #[test]
    fn stat_if_exists_maps_missing_to_none() {
        let temp = TempDir::new().expect("create tempdir");
        let fs_backend = LocalFilesystem::new();
        let missing = fs_backend
            .stat_if_exists(&temp.path().join("nope"))
            .expect("stat succeeds");
        assert!(missing.is_none());
    }

    #[test]
    fn read_dir_lists_children() {
        let temp = TempDir::new().expect("create tempdir");
        fs::write(temp.path().join("a"), b"1").expect("write");
        fs::create_dir(temp.path().join("d")).expect("mkdir");

        let fs_backend = LocalFilesystem::new();
        let mut names: Vec<_> = fs_backend
            .read_dir(temp.path())
            .expect("read_dir succeeds")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[test]
    fn create_dir_tolerates_existing() {
        let temp = TempDir::new().expect("create tempdir");
        let dir = temp.path().join("sub");
        let fs_backend = LocalFilesystem::new();
        fs_backend.create_dir(&dir).expect("first create");
        fs_backend.create_dir(&dir).expect("second create is a no-op");
    }

    #[test]
    fn atomic_move_replaces_target() {
        let temp = TempDir::new().expect("create tempdir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::write(&src, b"new").expect("write src");
        fs::write(&dst, b"old").expect("write dst");

        let fs_backend = LocalFilesystem::new();
        assert!(fs_backend.atomic_move(&src, &dst).expect("rename succeeds"));
        assert_eq!(fs::read(&dst).expect("read dst"), b"new");
        assert!(!src.exists());
    }

    #[test]
    fn set_mtime_round_trips() {
        let temp = TempDir::new().expect("create tempdir");
        let path = temp.path().join("stamp");
        fs::write(&path, b"x").expect("write");

        let fs_backend = LocalFilesystem::new();
        fs_backend.set_mtime(&path, 1_600_000_000).expect("utimes succeeds");
        let attrs = fs_backend.stat(&path).expect("stat succeeds");
        assert_eq!(attrs.mtime, 1_600_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_target_round_trips() {
        let temp = TempDir::new().expect("create tempdir");
        let link = temp.path().join("link");
        let fs_backend = LocalFilesystem::new();
        fs_backend
            .make_symlink(&link, Path::new("target/file"))
            .expect("symlink succeeds");
        assert_eq!(
            fs_backend.read_link_target(&link).expect("readlink succeeds"),
            b"target/file"
        );
        let attrs = fs_backend.stat(&link).expect("stat succeeds");
        assert!(attrs.is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn name_lookups_resolve_known_accounts() {
        let fs_backend = LocalFilesystem::new();
        assert_eq!(fs_backend.uid_for_name("root"), Some(0));
        assert_eq!(fs_backend.uid_for_name("no-such-user-wiresync"), None);
        assert_eq!(fs_backend.gid_for_name("no-such-group-wiresync"), None);
    }

    #[cfg(unix)]
    #[test]
    fn hard_linked_files_share_an_inode_identity() {
        let temp = TempDir::new().expect("create tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        fs::write(&first, b"shared").expect("write");
        fs::hard_link(&first, &second).expect("hard link");

        let fs_backend = LocalFilesystem::new();
        let a = fs_backend.stat(&first).expect("stat first");
        let b = fs_backend.stat(&second).expect("stat second");
        assert!(a.file_id.is_some());
        assert_eq!(a.file_id, b.file_id);
        assert!(a.nlink >= 2);
    }

    #[test]
    fn unlink_recursive_removes_trees_and_files() {
        let temp = TempDir::new().expect("create tempdir");
        let dir = temp.path().join("tree");
        fs::create_dir(&dir).expect("mkdir");
        fs::write(dir.join("inner"), b"x").expect("write");

        let fs_backend = LocalFilesystem::new();
        fs_backend.unlink_recursive(&dir).expect("remove tree");
        assert!(!dir.exists());
    }
}
