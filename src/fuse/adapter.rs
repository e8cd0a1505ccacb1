// FUSE adapter - bridges fuser callbacks to an FsInstance
//
// Inodes are the instance's own node numbers, so no path mapping is needed.
// Open files are kept in a handle table; reads and writes go straight to the
// underlying descriptor with positional I/O.

use crate::fs::{FileAttr, FileType, FsError, FsInstance, SetAttr};
use fuser::{
    FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, trace};

/// Default TTL for file attributes (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Default TTL for directory entries (1 second)
const ENTRY_TTL: Duration = Duration::from_secs(1);

pub struct FuseAdapter {
    fs: Arc<FsInstance>,
    handles: Mutex<HashMap<u64, File>>,
    next_handle: Mutex<u64>,
}

impl FuseAdapter {
    pub fn new(fs: Arc<FsInstance>) -> Self {
        Self { fs, handles: Mutex::new(HashMap::new()), next_handle: Mutex::new(1) }
    }

    fn add_handle(&self, file: File) -> u64 {
        let fh = {
            let mut next = self.next_handle.lock();
            let fh = *next;
            *next += 1;
            fh
        };
        self.handles.lock().insert(fh, file);
        fh
    }

    fn with_handle<T>(&self, fh: u64, f: impl FnOnce(&File) -> std::io::Result<T>) -> Result<T, libc::c_int> {
        let handles = self.handles.lock();
        let file = handles.get(&fh).ok_or(libc::EBADF)?;
        f(file).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    /// Convert our FileAttr to fuser FileAttr
    fn to_fuse_attr(attr: &FileAttr) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: attr.inode,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: datetime_to_systemtime(attr.atime),
            mtime: datetime_to_systemtime(attr.mtime),
            ctime: datetime_to_systemtime(attr.ctime),
            crtime: UNIX_EPOCH,
            kind: to_fuse_kind(attr.kind),
            perm: attr.mode as u16,
            nlink: attr.nlinks,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn to_fuse_kind(kind: FileType) -> FuseFileType {
    match kind {
        FileType::RegularFile => FuseFileType::RegularFile,
        FileType::Directory => FuseFileType::Directory,
        FileType::Symlink => FuseFileType::Symlink,
        FileType::CharDevice => FuseFileType::CharDevice,
        FileType::BlockDevice => FuseFileType::BlockDevice,
        FileType::NamedPipe => FuseFileType::NamedPipe,
    }
}

/// Whether open flags ask for write access.
fn wants_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0
}

/// Convert chrono DateTime to SystemTime
fn datetime_to_systemtime(dt: chrono::DateTime<chrono::Utc>) -> SystemTime {
    match u64::try_from(dt.timestamp()) {
        Ok(secs) => UNIX_EPOCH + Duration::new(secs, dt.timestamp_subsec_nanos()),
        Err(_) => UNIX_EPOCH,
    }
}

/// Convert SystemTime to chrono DateTime
fn systemtime_to_datetime(st: SystemTime) -> chrono::DateTime<chrono::Utc> {
    let duration = st.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    chrono::DateTime::from_timestamp(duration.as_secs() as i64, duration.subsec_nanos())
        .unwrap_or_else(chrono::Utc::now)
}

fn to_datetime(t: TimeOrNow) -> chrono::DateTime<chrono::Utc> {
    match t {
        TimeOrNow::SpecificTime(st) => systemtime_to_datetime(st),
        TimeOrNow::Now => chrono::Utc::now(),
    }
}

/// Answer an xattr size probe or data request the way the kernel expects.
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(libc::ERANGE);
    } else {
        reply.data(data);
    }
}

macro_rules! name_or_einval {
    ($name:expr, $reply:expr) => {
        match $name.to_str() {
            Some(n) => n,
            None => {
                $reply.error(libc::EINVAL);
                return;
            }
        }
    };
}

fn reply_entry(result: Result<FileAttr, FsError>, reply: ReplyEntry) {
    match result {
        Ok(attr) => reply.entry(&ENTRY_TTL, &FuseAdapter::to_fuse_attr(&attr), 0),
        Err(e) => reply.error(e.to_errno()),
    }
}

fn reply_empty(result: Result<(), FsError>, reply: ReplyEmpty) {
    match result {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.to_errno()),
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> Result<(), libc::c_int> {
        info!(image = %self.fs.image(), "FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.handles.lock().clear();
        info!(image = %self.fs.image(), "FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name_or_einval!(name, reply);
        reply_entry(self.fs.lookup(parent, name), reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &Self::to_fuse_attr(&attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = SetAttr { mode, uid, gid, size, atime: atime.map(to_datetime), mtime: mtime.map(to_datetime) };
        match self.fs.setattr(ino, &attr) {
            Ok(attr) => reply.attr(&ATTR_TTL, &Self::to_fuse_attr(&attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let name = name_or_einval!(name, reply);
        reply_entry(self.fs.mkdir(parent, name, mode & !umask), reply);
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_or_einval!(name, reply);
        reply_empty(self.fs.unlink(parent, name), reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_or_einval!(name, reply);
        reply_empty(self.fs.rmdir(parent, name), reply);
    }

    fn symlink(&mut self, _req: &Request, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let name = name_or_einval!(link_name, reply);
        let target = name_or_einval!(target.as_os_str(), reply);
        reply_entry(self.fs.symlink(parent, name, target), reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name_or_einval!(name, reply);
        let newname = name_or_einval!(newname, reply);
        reply_empty(self.fs.rename(parent, name, newparent, newname), reply);
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let newname = name_or_einval!(newname, reply);
        reply_entry(self.fs.link(ino, newparent, newname), reply);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let write = wants_write(flags);
        trace!(ino, write, "open");
        match self.fs.open(ino, write) {
            Ok(file) => {
                if flags & libc::O_TRUNC != 0 {
                    if let Err(e) = file.set_len(0) {
                        reply.error(e.raw_os_error().unwrap_or(libc::EIO));
                        return;
                    }
                }
                reply.opened(self.add_handle(file), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.with_handle(fh, |file| {
            let mut buf = vec![0u8; size as usize];
            let n = file.read_at(&mut buf, offset.max(0) as u64)?;
            buf.truncate(n);
            Ok(buf)
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.with_handle(fh, |file| file.write_at(data, offset.max(0) as u64)) {
            Ok(n) => reply.written(n as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.lock().remove(&fh);
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.fs.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let parent = match self.fs.path_of(ino).map(|p| crate::entry::parent_name(&p).to_string()) {
            Ok(p) => self.fs.resolve(&p).unwrap_or(ino),
            Err(_) => ino,
        };

        let mut all_entries =
            vec![(ino, FuseFileType::Directory, ".".to_string()), (parent, FuseFileType::Directory, "..".to_string())];
        all_entries.extend(entries.into_iter().map(|e| (e.inode, to_fuse_kind(e.kind), e.name)));

        for (i, (inode, kind, name)) in all_entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*inode, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.fs.rw_dir()) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name_or_einval!(name, reply);
        reply_empty(self.fs.setxattr(ino, name, value), reply);
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = name_or_einval!(name, reply);
        match self.fs.getxattr(ino, name) {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.listxattr(ino) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                reply_xattr(reply, size, &buf);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_or_einval!(name, reply);
        reply_empty(self.fs.removexattr(ino, name), reply);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name_or_einval!(name, reply);
        match self.fs.create(parent, name, mode & !umask) {
            Ok((attr, file)) => {
                let fh = self.add_handle(file);
                reply.created(&ENTRY_TTL, &Self::to_fuse_attr(&attr), 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_write() {
        assert!(!wants_write(libc::O_RDONLY));
        assert!(wants_write(libc::O_WRONLY));
        assert!(wants_write(libc::O_RDWR | libc::O_APPEND));
        assert!(wants_write(libc::O_RDONLY | libc::O_TRUNC));
    }

    #[test]
    fn test_datetime_conversion() {
        let dt = chrono::Utc::now();
        let st = datetime_to_systemtime(dt);
        let dt2 = systemtime_to_datetime(st);
        assert_eq!(dt.timestamp(), dt2.timestamp());
        assert_eq!(dt.timestamp_subsec_nanos(), dt2.timestamp_subsec_nanos());
    }

    #[test]
    fn test_pre_epoch_time_clamps() {
        let dt = chrono::DateTime::from_timestamp(-10, 0).unwrap();
        assert_eq!(datetime_to_systemtime(dt), UNIX_EPOCH);
    }

    #[test]
    fn test_fuse_attr_conversion() {
        let entry = crate::entry::Entry::symlink("bin/sh", "dash");
        let attr = FileAttr::from_entry(5, &entry);
        let fuse = FuseAdapter::to_fuse_attr(&attr);
        assert_eq!(fuse.ino, 5);
        assert_eq!(fuse.kind, FuseFileType::Symlink);
        assert_eq!(fuse.size, 4);
        assert_eq!(fuse.perm, 0o777);
    }
}
