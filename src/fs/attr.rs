use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use super::error::{FsError, FsResult};
use crate::entry::{Entry, EntryKind, WHITEOUT_PREFIX};

const MAX_FILENAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
}

impl From<EntryKind> for FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Dir => FileType::Directory,
            EntryKind::Reg | EntryKind::Hardlink => FileType::RegularFile,
            EntryKind::Symlink => FileType::Symlink,
            EntryKind::Char => FileType::CharDevice,
            EntryKind::Block => FileType::BlockDevice,
            EntryKind::Fifo => FileType::NamedPipe,
        }
    }
}

impl From<std::fs::FileType> for FileType {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_char_device() {
            FileType::CharDevice
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else if ft.is_fifo() {
            FileType::NamedPipe
        } else {
            FileType::RegularFile
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileAttr {
    pub inode: u64,
    pub kind: FileType,
    pub size: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub mode: u32, // Permission bits
    pub uid: u32,
    pub gid: u32,
    pub nlinks: u32,
    pub rdev: u32,
}

impl FileAttr {
    /// Attributes as recorded in the image metadata.
    pub fn from_entry(inode: u64, entry: &Entry) -> Self {
        let kind = FileType::from(entry.kind);
        let size = match kind {
            FileType::Directory => 4096,
            FileType::Symlink => entry.link_name.len() as u64,
            FileType::RegularFile => entry.size,
            _ => 0,
        };
        let mtime = entry.mod_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            inode,
            kind,
            size,
            atime: mtime,
            mtime,
            ctime: mtime,
            mode: entry.mode & 0o7777,
            uid: entry.uid,
            gid: entry.gid,
            nlinks: entry.num_link.max(1),
            rdev: libc::makedev(entry.dev_major, entry.dev_minor) as u32,
        }
    }

    /// Attributes of a materialised file in the writable directory.
    pub fn from_metadata(inode: u64, meta: &Metadata) -> Self {
        Self {
            inode,
            kind: FileType::from(meta.file_type()),
            size: meta.len(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
            ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            nlinks: meta.nlink() as u32,
            rdev: meta.rdev() as u32,
        }
    }
}

fn timestamp(secs: i64, nsecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nsecs as u32).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u64,
    pub name: String,
    pub kind: FileType,
}

/// Set attributes parameters
#[derive(Debug, Default, Clone)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
            && self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
    }
}

/// Validate a single name component supplied by a write operation.
pub fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidPath(format!("bad name {name:?}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidPath(format!("bad name {name:?}")));
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(FsError::FilenameTooLong(name.len()));
    }
    if name.starts_with(WHITEOUT_PREFIX) {
        return Err(FsError::NotPermitted(name.to_string()));
    }
    Ok(())
}
