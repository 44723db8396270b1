//! Error kinds returned by the core filesystem operations.

use std::fmt;
use std::io;

/// An error produced by a core operation.
///
/// Every fallible step returns on first failure; the core never retries
/// internally.
#[derive(Debug)]
pub enum Error {
    /// A backing-file read or write failed.
    Io(io::Error),
    /// A path component does not exist.
    NoSuchEntry,
    /// A path component expected to be a directory is not one.
    NotDir,
    /// A path component expected to be a regular file is a directory.
    IsDir,
    /// The target name already exists in the parent directory.
    Exists,
    /// A directory being removed still has entries other than `.`/`..`.
    NotEmpty,
    /// The allocator has no free block large enough to satisfy a request.
    NoSpace,
    /// A permission bit required for the operation is not set.
    PermissionDenied,
    /// A path component's name exceeds 255 bytes.
    NameTooLong,
    /// A directory's hard-link count would overflow `u16`.
    MaxLinks,
    /// A regular file cannot be removed because it is currently open.
    Busy,
    /// A handle index does not refer to a live, open handle.
    BadHandle,
    /// The container was mounted read-only.
    ReadOnly,
    /// The requested operation is not implemented by this filesystem.
    NotSupported,
    /// An offset lies beyond the representable or current file length.
    Overflow,
    /// An argument violates a precondition (e.g. empty name, bad path).
    Invalid,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NoSuchEntry => write!(f, "no such file or directory"),
            Self::NotDir => write!(f, "not a directory"),
            Self::IsDir => write!(f, "is a directory"),
            Self::Exists => write!(f, "file exists"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::NoSpace => write!(f, "no space left on container"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::NameTooLong => write!(f, "name too long"),
            Self::MaxLinks => write!(f, "too many links"),
            Self::Busy => write!(f, "resource busy"),
            Self::BadHandle => write!(f, "bad handle"),
            Self::ReadOnly => write!(f, "read-only filesystem"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Overflow => write!(f, "value too large"),
            Self::Invalid => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl Error {
    /// Maps a core error to a negative POSIX errno, as consumed by the FUSE
    /// bridge (spec §7: "0 for success, negative POSIX errno for failure").
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(_) => libc::EIO,
            Self::NoSuchEntry => libc::ENOENT,
            Self::NotDir => libc::ENOTDIR,
            Self::IsDir => libc::EISDIR,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NoSpace => libc::ENOSPC,
            Self::PermissionDenied => libc::EACCES,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::MaxLinks => libc::EMLINK,
            Self::Busy => libc::EBUSY,
            Self::BadHandle => libc::EBADF,
            Self::ReadOnly => libc::EROFS,
            Self::NotSupported => libc::ENOSYS,
            Self::Overflow => libc::EOVERFLOW,
            Self::Invalid => libc::EINVAL,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
