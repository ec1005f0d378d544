#![forbid(unsafe_code)]
//! Error types for the zoned storage backend.
//!
//! Defines `ZbdError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the filesystem layer's syscall-shaped replies.

use thiserror::Error;

/// Unified error type for all zoned-device operations.
#[derive(Debug, Error)]
pub enum ZbdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device acknowledged fewer bytes than were submitted.
    #[error("short write: submitted {submitted} bytes, completed {completed}")]
    ShortWrite { submitted: u64, completed: u64 },

    /// An asynchronous write did not complete within the reap timeout.
    #[error("write completion timed out")]
    CompletionTimeout,

    #[error("zone management command failed: {op} at zone offset {start:#x}")]
    ZoneManagement { op: &'static str, start: u64 },

    #[error("no space left in zone")]
    NoSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

/// The four failure classes the engine reports upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZbdErrorKind {
    Io,
    NoSpace,
    InvalidArgument,
    NotSupported,
}

impl ZbdError {
    /// Collapse the error into its reportable class.
    ///
    /// Short writes, completion timeouts, and failed zone management
    /// commands are all raw device failures from the caller's viewpoint.
    #[must_use]
    pub fn kind(&self) -> ZbdErrorKind {
        match self {
            Self::Io(_)
            | Self::ShortWrite { .. }
            | Self::CompletionTimeout
            | Self::ZoneManagement { .. } => ZbdErrorKind::Io,
            Self::NoSpace => ZbdErrorKind::NoSpace,
            Self::InvalidArgument(_) => ZbdErrorKind::InvalidArgument,
            Self::NotSupported(_) => ZbdErrorKind::NotSupported,
        }
    }

    /// Convert this error into a POSIX errno for the layer above.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ShortWrite { .. } | Self::ZoneManagement { .. } => libc::EIO,
            Self::CompletionTimeout => libc::ETIMEDOUT,
            Self::NoSpace => libc::ENOSPC,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
        }
    }
}

/// Result alias using `ZbdError`.
pub type Result<T> = std::result::Result<T, ZbdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_collapse_io_family() {
        let errs: [ZbdError; 4] = [
            std::io::Error::from(std::io::ErrorKind::Other).into(),
            ZbdError::ShortWrite {
                submitted: 8192,
                completed: 4096,
            },
            ZbdError::CompletionTimeout,
            ZbdError::ZoneManagement {
                op: "reset",
                start: 0,
            },
        ];
        for err in errs {
            assert_eq!(err.kind(), ZbdErrorKind::Io);
        }
        assert_eq!(ZbdError::NoSpace.kind(), ZbdErrorKind::NoSpace);
        assert_eq!(
            ZbdError::NotSupported(String::new()).kind(),
            ZbdErrorKind::NotSupported
        );
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(ZbdError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(
            ZbdError::InvalidArgument("scheduler".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            ZbdError::NotSupported("model".to_owned()).to_errno(),
            libc::EOPNOTSUPP
        );
        assert_eq!(ZbdError::CompletionTimeout.to_errno(), libc::ETIMEDOUT);
        let os = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(ZbdError::Io(os).to_errno(), libc::EBADF);
    }
}
