//! Copy-up of read-only entries into the writable directory.

use chrono::{DateTime, Utc};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::entry::{Entry, EntryKind, WHITEOUT_PREFIX};

/// Recreate `entry` at `dst`, copying bytes from `location` when it has any.
///
/// The parent of `dst` must already exist.
pub(crate) fn materialize(entry: &Entry, location: Option<&Path>, dst: &Path, privileged: bool) -> io::Result<()> {
    match entry.kind {
        EntryKind::Dir => {
            match fs::create_dir(dst) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            set_mode(dst, entry.mode, 0o755)?;
        }
        EntryKind::Symlink => {
            remove_existing(dst)?;
            std::os::unix::fs::symlink(&entry.link_name, dst)?;
        }
        EntryKind::Reg | EntryKind::Hardlink => {
            remove_existing(dst)?;
            match location {
                Some(src) => {
                    fs::copy(src, dst)?;
                }
                None => {
                    fs::File::create(dst)?;
                }
            }
            set_mode(dst, entry.mode, 0o644)?;
        }
        EntryKind::Char | EntryKind::Block | EntryKind::Fifo => {
            remove_existing(dst)?;
            let kind = match entry.kind {
                EntryKind::Char => SFlag::S_IFCHR,
                EntryKind::Block => SFlag::S_IFBLK,
                _ => SFlag::S_IFIFO,
            };
            let dev = makedev(u64::from(entry.dev_major), u64::from(entry.dev_minor));
            mknod(dst, kind, Mode::from_bits_truncate(entry.mode & 0o7777), dev).map_err(io::Error::from)?;
        }
    }

    for (name, value) in &entry.xattrs {
        set_xattr(dst, name, value)?;
    }
    if privileged {
        std::os::unix::fs::lchown(dst, Some(entry.uid), Some(entry.gid))?;
    }
    if let Some(mtime) = entry.mod_time {
        set_times(dst, Some(mtime), Some(mtime))?;
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32, fallback: u32) -> io::Result<()> {
    let bits = match mode & 0o7777 {
        0 => fallback,
        bits => bits,
    };
    fs::set_permissions(path, fs::Permissions::from_mode(bits))
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

pub(crate) fn set_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    let (path, name) = (c_path(path)?, c_name(name)?);
    // SAFETY: both strings are NUL terminated and value outlives the call.
    let rc = unsafe { libc::lsetxattr(path.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn remove_xattr(path: &Path, name: &str) -> io::Result<()> {
    let (path, name) = (c_path(path)?, c_name(name)?);
    // SAFETY: both strings are NUL terminated.
    let rc = unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENODATA) {
            return Err(err);
        }
    }
    Ok(())
}

fn timespec(time: Option<DateTime<Utc>>) -> libc::timespec {
    match time {
        Some(t) => libc::timespec { tv_sec: t.timestamp() as libc::time_t, tv_nsec: t.timestamp_subsec_nanos() as _ },
        None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
    }
}

/// Set access and modification times without following symlinks.
pub(crate) fn set_times(path: &Path, atime: Option<DateTime<Utc>>, mtime: Option<DateTime<Utc>>) -> io::Result<()> {
    let path = c_path(path)?;
    let times = [timespec(atime), timespec(mtime)];
    // SAFETY: path is NUL terminated and times has the two elements utimensat reads.
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Leave an overlay-style deletion marker for `name` inside `dir`.
pub(crate) fn write_whiteout(dir: &Path, name: &str) -> io::Result<()> {
    fs::write(dir.join(format!("{WHITEOUT_PREFIX}{name}")), b"")
}

/// Drop a deletion marker left by an earlier unlink of `name`.
pub(crate) fn clear_whiteout(dir: &Path, name: &str) -> io::Result<()> {
    remove_existing(&dir.join(format!("{WHITEOUT_PREFIX}{name}")))
}
