//! FUSE filesystem implementation
//!
//! Serves a [`crate::tree::NodeTree`] read-only to the kernel and reports
//! file accesses to a [`crate::monitor::Monitor`].

mod filesystem;
mod handle;

pub use filesystem::TarFs;
pub use handle::{wants_write, FileHandle, HandleManager};
