use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by client operations.
///
/// The interception shim translates these to POSIX `errno` values via
/// [`Error::errno`]; inside the crate they stay structured so that the read
/// engine can distinguish, say, a reply that matched no request from a
/// delegator that never produced one.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("directory not empty")]
    NotEmpty,
    /// The file is laminated; no mutation is possible.
    #[error("file is read-only")]
    ReadOnly,
    #[error("bad file descriptor")]
    BadFd,
    #[error("invalid argument")]
    InvalidArg,
    #[error("offset arithmetic overflows the file offset domain")]
    Overflow,
    #[error("out of storage")]
    OutOfMemory,
    #[error("path name too long")]
    NameTooLong,
    #[error("rename crosses the mount boundary")]
    CrossDevice,
    #[error("file descriptor table exhausted")]
    FdExhausted,
    #[error("resource busy")]
    Busy,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("timed out waiting for the delegator to fill the reply region")]
    ShmemTimeout,
    #[error("read reply spans non-contiguous requests")]
    MatchGap,
    #[error("read reply matches no outstanding request")]
    MatchMiss,
    #[error("operation not supported")]
    Unsupported,
}

impl Error {
    /// The `errno` value the shim reports for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::NotFound => Errno::ENOENT,
            Self::Exists => Errno::EEXIST,
            Self::IsDir => Errno::EISDIR,
            Self::NotDir => Errno::ENOTDIR,
            Self::NotEmpty => Errno::ENOTEMPTY,
            Self::ReadOnly => Errno::EROFS,
            Self::BadFd => Errno::EBADF,
            Self::InvalidArg => Errno::EINVAL,
            Self::Overflow => Errno::EOVERFLOW,
            Self::OutOfMemory => Errno::ENOMEM,
            Self::NameTooLong => Errno::ENAMETOOLONG,
            Self::CrossDevice => Errno::EXDEV,
            Self::FdExhausted => Errno::EMFILE,
            Self::Busy => Errno::EBUSY,
            Self::Io(_) | Self::ShmemTimeout | Self::MatchGap | Self::MatchMiss => Errno::EIO,
            Self::Unsupported => Errno::ENOTSUP,
        }
    }
}

impl From<gustfs_logstore::Error> for Error {
    fn from(e: gustfs_logstore::Error) -> Self {
        use gustfs_logstore::Error as LogError;
        match e {
            LogError::Full { .. } => Self::OutOfMemory,
            LogError::OutOfBounds { .. } => Self::Io(io::Error::other(e.to_string())),
            LogError::Io(io) => Self::Io(io),
        }
    }
}

impl From<gustfs_proto::shm::ShmError> for Error {
    fn from(e: gustfs_proto::shm::ShmError) -> Self {
        use gustfs_proto::shm::ShmError;
        match e {
            ShmError::Timeout => Self::ShmemTimeout,
            other => Self::Io(io::Error::other(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound.errno(), Errno::ENOENT);
        assert_eq!(Error::ReadOnly.errno(), Errno::EROFS);
        assert_eq!(Error::ShmemTimeout.errno(), Errno::EIO);
        assert_eq!(Error::MatchGap.errno(), Errno::EIO);
        assert_eq!(Error::Unsupported.errno(), Errno::ENOTSUP);
    }
}
