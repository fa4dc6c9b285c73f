//! Open file handle table

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tree::Ino;

/// An open regular file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    /// Inode the handle was opened on (the backing node for links)
    pub ino: Ino,
}

/// Whether open flags request write access
pub fn wants_write(flags: i32) -> bool {
    let mode = flags & libc::O_ACCMODE;
    mode == libc::O_WRONLY || mode == libc::O_RDWR || flags & libc::O_TRUNC != 0
}

/// Manages open file handles
pub struct HandleManager {
    /// Next handle ID; 0 is never handed out
    next_id: AtomicU64,
    handles: RwLock<HashMap<u64, FileHandle>>,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle ID
    pub fn open(&self, ino: Ino) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, FileHandle { ino });
        fh
    }

    pub fn get(&self, fh: u64) -> Option<FileHandle> {
        self.handles.read().get(&fh).copied()
    }

    pub fn close(&self, fh: u64) -> Option<FileHandle> {
        self.handles.write().remove(&fh)
    }

    /// Number of handles currently open
    pub fn open_count(&self) -> usize {
        self.handles.read().len()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
