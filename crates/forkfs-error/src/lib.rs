#![forbid(unsafe_code)]
//! Error types for ForkFS.
//!
//! Defines `ForkFsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the host VFS error channel.

use forkfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all ForkFS operations.
#[derive(Debug, Error)]
pub enum ForkFsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    #[error("invalid on-storage format: {0}")]
    Format(#[from] ParseError),

    #[error("no space left in delta region")]
    NoSpace,

    #[error("index allocation failed")]
    NoMem,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("branch is stale")]
    Stale,

    #[error("read-only mount")]
    ReadOnly,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("user data copy failed mid-record")]
    Fault,
}

impl ForkFsError {
    /// Convert this error into a POSIX errno suitable for VFS replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Invalid(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMem => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::Stale => libc::ESTALE,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Fault => libc::EFAULT,
        }
    }
}

/// Result alias using `ForkFsError`.
pub type Result<T> = std::result::Result<T, ForkFsError>;
