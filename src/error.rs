//! Error types for tarfs-monitor

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while building, serving or tearing down a mount
#[derive(Debug, Error)]
pub enum Error {
    /// Header or body corruption in the input stream
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// No node exists at the requested path or inode
    #[error("not found: {0}")]
    NotFound(String),

    /// Content read attempted on a node without a byte range
    #[error("{path} is not readable ({kind})")]
    NotReadable { path: String, kind: &'static str },

    /// Directory operation attempted on a non-directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Symlink chain too long or cyclic
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),

    /// Operation not meaningful for the node, e.g. readlink on a regular file
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Extended attribute not present on the node
    #[error("no such attribute: {0}")]
    NoAttribute(String),

    /// Write access requested on the read-only mount
    #[error("read-only filesystem")]
    ReadOnly,

    /// FUSE session could not be started
    #[error("failed to mount {mountpoint:?}: {source}")]
    Mount {
        mountpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The OS refused to unmount
    #[error("failed to unmount {mountpoint:?}: {source}")]
    Unmount {
        mountpoint: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration could not be read or written
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration values are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errno reported to the kernel for a failed filesystem call
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotReadable { kind, .. } if *kind == "directory" => libc::EISDIR,
            Error::NotReadable { .. } => libc::EPERM,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::SymlinkLoop(_) => libc::ELOOP,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::NoAttribute(_) => libc::ENODATA,
            Error::ReadOnly => libc::EROFS,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}
