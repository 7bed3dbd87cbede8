//! Engine-facing result, option, and time types.

use std::io;

use libc::c_int;
use thiserror::Error;

/// Error kinds surfaced by every engine operation. Each maps onto the POSIX
/// errno the adapter replies with.
#[derive(Debug, Error)]
pub enum FsError {
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
    #[error("buffer too small for value")]
    Range,
    #[error("no data available")]
    NoData,
    #[error("operation not supported")]
    Unsupported,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("out of memory")]
    NoMemory,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    pub fn errno(&self) -> c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::IsDir => libc::EISDIR,
            FsError::NotDir => libc::ENOTDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Range => libc::ERANGE,
            FsError::NoData => libc::ENODATA,
            FsError::Unsupported => libc::EOPNOTSUPP,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::NoMemory => libc::ENOMEM,
            // host errno passes through; a failure without one is EIO
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// One half of a set_times request.
#[derive(Debug, Clone, Copy)]
pub enum SetTime {
    Now,
    Omit,
    /// Seconds since the epoch; callers truncate nanoseconds away.
    At(i64),
}

impl SetTime {
    pub fn resolve(self, now: i64, current: i64) -> i64 {
        match self {
            SetTime::Now => now,
            SetTime::Omit => current,
            SetTime::At(secs) => secs,
        }
    }
}

/// Floor below which the write buffer capacity may not be configured; also
/// the minimum flush granularity of the staging pipeline.
pub const MIN_WRITE_BUFFER: usize = 4 * 1024;
pub const DEFAULT_WRITE_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Staging buffer capacity handed to each new open handle.
    pub write_buffer_size: usize,
    /// Stop replay at the first bad record instead of skipping it.
    pub strict_replay: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER,
            strict_replay: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::Invalid("x").errno(), libc::EINVAL);
        let host = FsError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(host.errno(), libc::ENOSPC);
        let anon = FsError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(anon.errno(), libc::EIO);
    }

    #[test]
    fn set_time_resolution() {
        assert_eq!(SetTime::Now.resolve(100, 5), 100);
        assert_eq!(SetTime::Omit.resolve(100, 5), 5);
        assert_eq!(SetTime::At(42).resolve(100, 5), 42);
    }
}
