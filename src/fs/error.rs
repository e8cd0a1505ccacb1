use std::io;
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("File or directory already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Filename too long: {0} bytes (max 255)")]
    FilenameTooLong(usize),

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("No such attribute: {0}")]
    NoData(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Timed out waiting for: {0}")]
    TimedOut(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Convert to POSIX errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::PathNotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::FilenameTooLong(_) => libc::ENAMETOOLONG,
            FsError::NotPermitted(_) => libc::EPERM,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::NotSupported(_) => libc::ENOSYS,
            FsError::NoData(_) => libc::ENODATA,
            FsError::ExtractionFailed(_) => libc::EIO,
            FsError::TimedOut(_) => libc::ETIMEDOUT,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
