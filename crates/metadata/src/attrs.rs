//! Attribute records shared by the file-list codec and the back-end.

/// Mask selecting the file-type bits of a mode word.
pub const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// File type carried in the high bits of the mode word.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
    /// Block device.
    BlockDevice,
    /// Character device.
    CharDevice,
    /// Anything this implementation cannot classify.
    Unknown,
}

impl FileType {
    /// Classifies a raw mode word.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            _ => Self::Unknown,
        }
    }

    /// Type bits for the mode word.
    #[must_use]
    pub const fn mode_bits(self) -> u32 {
        match self {
            Self::Regular | Self::Unknown => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
            Self::BlockDevice => S_IFBLK,
            Self::CharDevice => S_IFCHR,
        }
    }

    /// Returns `true` for block and character devices.
    #[must_use]
    pub const fn is_device(self) -> bool {
        matches!(self, Self::BlockDevice | Self::CharDevice)
    }

    /// Returns `true` for fifos and sockets.
    #[must_use]
    pub const fn is_special(self) -> bool {
        matches!(self, Self::Fifo | Self::Socket)
    }
}

/// Owning user: numeric id plus the name when one is known.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct User {
    /// Numeric uid.
    pub uid: u32,
    /// Account name; empty when only the id is known.
    pub name: String,
}

impl User {
    /// User known only by id.
    #[must_use]
    pub fn from_uid(uid: u32) -> Self {
        Self { uid, name: String::new() }
    }
}

/// Owning group: numeric id plus the name when one is known.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Group {
    /// Numeric gid.
    pub gid: u32,
    /// Group name; empty when only the id is known.
    pub name: String,
}

impl Group {
    /// Group known only by id.
    #[must_use]
    pub fn from_gid(gid: u32) -> Self {
        Self { gid, name: String::new() }
    }
}

/// Portable attribute record for one filesystem entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileAttrs {
    /// Full mode word: type bits plus permissions.
    pub mode: u32,
    /// Size in bytes; zero for non-regular entries.
    pub size: u64,
    /// Last modification time, seconds since the epoch, clamped to zero.
    pub mtime: i64,
    /// Owning user.
    pub user: User,
    /// Owning group.
    pub group: Group,
    /// Device major number, for device entries.
    pub rdev_major: u32,
    /// Device minor number, for device entries.
    pub rdev_minor: u32,
    /// Hard-link count reported by the back-end; 1 when unknown. Never
    /// travels on the wire.
    pub nlink: u64,
    /// Identity of the backing inode as `(device, inode)`; `None` when the
    /// back-end cannot provide one. Never travels on the wire.
    pub file_id: Option<(u64, u64)>,
}

impl FileAttrs {
    /// Builds a record for a regular file.
    #[must_use]
    pub fn regular(perms: u32, size: u64, mtime: i64) -> Self {
        Self {
            mode: FileType::Regular.mode_bits() | (perms & !S_IFMT),
            size,
            mtime: mtime.max(0),
            user: User::default(),
            group: Group::default(),
            rdev_major: 0,
            rdev_minor: 0,
            nlink: 1,
            file_id: None,
        }
    }

    /// Builds a record for a directory.
    #[must_use]
    pub fn directory(perms: u32, mtime: i64) -> Self {
        Self {
            mode: FileType::Directory.mode_bits() | (perms & !S_IFMT),
            size: 0,
            mtime: mtime.max(0),
            user: User::default(),
            group: Group::default(),
            rdev_major: 0,
            rdev_minor: 0,
            nlink: 1,
            file_id: None,
        }
    }

    /// File type derived from the mode word.
    #[inline]
    #[must_use]
    pub const fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Permission bits without the type.
    #[inline]
    #[must_use]
    pub const fn perms(&self) -> u32 {
        self.mode & !S_IFMT
    }

    /// Returns `true` for regular files.
    #[inline]
    #[must_use]
    pub const fn is_regular(&self) -> bool {
        matches!(self.file_type(), FileType::Regular)
    }

    /// Returns `true` for directories.
    #[inline]
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        matches!(self.file_type(), FileType::Directory)
    }

    /// Returns `true` for symbolic links.
    #[inline]
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        matches!(self.file_type(), FileType::Symlink)
    }

    /// Quick-check equality: same size and mtime, the signal that a regular
    /// file needs no transfer.
    #[must_use]
    pub fn quick_check_matches(&self, other: &Self) -> bool {
        self.size == other.size && self.mtime == other.mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_round_trip() {
        for file_type in [
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
            FileType::Fifo,
            FileType::Socket,
            FileType::BlockDevice,
            FileType::CharDevice,
        ] {
            assert_eq!(FileType::from_mode(file_type.mode_bits() | 0o644), file_type);
        }
    }

    #[test]
    fn unclassifiable_modes_are_unknown() {
        assert_eq!(FileType::from_mode(0o777), FileType::Unknown);
    }

    #[test]
    fn perms_strip_the_type() {
        let attrs = FileAttrs::regular(0o4755, 10, 0);
        assert_eq!(attrs.perms(), 0o4755);
        assert!(attrs.is_regular());
    }

    #[test]
    fn negative_mtime_is_clamped() {
        assert_eq!(FileAttrs::regular(0o644, 0, -5).mtime, 0);
    }

    #[test]
    fn quick_check_compares_size_and_mtime_only() {
        let a = FileAttrs::regular(0o644, 100, 1_700_000_000);
        let mut b = FileAttrs::regular(0o600, 100, 1_700_000_000);
        assert!(a.quick_check_matches(&b));
        b.size = 101;
        assert!(!a.quick_check_matches(&b));
    }
}
