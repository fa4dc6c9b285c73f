//! tarfs-monitor - Read-only FUSE view of a tar archive with access logging
//!
//! The archive is parsed once into an in-memory tree. OCI whiteout and
//! opaque markers are translated into their overlayfs representation. Every
//! open and read of a regular file is recorded under its canonical path.

pub mod archive;
pub mod config;
pub mod error;
pub mod fs;
pub mod monitor;
pub mod mount;
pub mod tree;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::{Error, Result};
pub use monitor::{Monitor, NullMonitor, OpenReadMonitor};
pub use mount::{mount, mount_reader, MountHandle};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::monitor::{Monitor, OpenReadMonitor};
    pub use crate::mount::{mount, mount_reader, MountHandle};
    pub use crate::tree::{Node, NodeKind, NodeTree};
}
