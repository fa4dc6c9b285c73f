//! Access monitoring
//!
//! The filesystem reports every successful open and read of a regular file to
//! a [`Monitor`] using the canonical path of the backing node. A hardlink or
//! symlink never shows up under its own name.

use parking_lot::Mutex;

/// Observer of file accesses on a mounted tree
pub trait Monitor: Send + Sync {
    /// A regular file was opened
    fn on_open(&self, path: &str);

    /// A read call on a regular file completed
    fn on_read(&self, path: &str);

    /// Everything observed so far, in order
    fn dump_log(&self) -> Vec<String>;
}

/// Records every open and read, in call order, without deduplication
#[derive(Debug, Default)]
pub struct OpenReadMonitor {
    log: Mutex<Vec<String>>,
}

impl OpenReadMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    fn record(&self, path: &str) {
        self.log.lock().push(path.to_string());
    }
}

impl Monitor for OpenReadMonitor {
    fn on_open(&self, path: &str) {
        self.record(path);
    }

    fn on_read(&self, path: &str) {
        self.record(path);
    }

    fn dump_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

/// Monitor that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn on_open(&self, _path: &str) {}

    fn on_read(&self, _path: &str) {}

    fn dump_log(&self) -> Vec<String> {
        Vec::new()
    }
}
