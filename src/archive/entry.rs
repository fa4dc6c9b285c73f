//! Typed archive entries

use std::collections::BTreeMap;

use super::source::BodyRange;

/// Kind of a parsed archive record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file with a body in the archive
    Regular { body: BodyRange },
    /// Directory
    Directory,
    /// Symbolic link to an arbitrary target string
    Symlink { target: String },
    /// Hard link to an earlier entry, as a normalized archive path
    Hardlink { target: String },
    /// Character device
    CharDevice { major: u32, minor: u32 },
    /// Block device
    BlockDevice { major: u32, minor: u32 },
    /// Named pipe
    Fifo,
}

impl EntryKind {
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::Regular { .. } => "regular",
            EntryKind::Directory => "directory",
            EntryKind::Symlink { .. } => "symlink",
            EntryKind::Hardlink { .. } => "hardlink",
            EntryKind::CharDevice { .. } => "chardev",
            EntryKind::BlockDevice { .. } => "blockdev",
            EntryKind::Fifo => "fifo",
        }
    }
}

/// One archive record, immutable once parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Normalized slash-separated path; empty for the archive root
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits (no file type bits)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    /// Extended attributes from `SCHILY.xattr.*` records
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Entry {
    /// Create an entry with default metadata
    #[cfg(test)]
    pub fn new(path: impl Into<String>, kind: EntryKind) -> Self {
        let mode = match kind {
            EntryKind::Directory => 0o755,
            EntryKind::Symlink { .. } => 0o777,
            _ => 0o644,
        };
        Entry {
            path: path.into(),
            kind,
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            xattrs: BTreeMap::new(),
        }
    }

    /// Final path component
    pub fn base_name(&self) -> &str {
        split_parent(&self.path).1
    }

    /// Path of the containing directory
    pub fn parent_path(&self) -> &str {
        split_parent(&self.path).0
    }

    /// Body size, zero for everything but regular files
    pub fn size(&self) -> u64 {
        match &self.kind {
            EntryKind::Regular { body } => body.size,
            _ => 0,
        }
    }
}

/// Split a normalized path into (parent, base)
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Normalize an archive path.
///
/// Leading `/` and `./` prefixes, `.` components and trailing slashes are
/// dropped. Returns `None` if a `..` component would escape the root.
pub fn normalize_path(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => continue,
            ".." => return None,
            c => parts.push(c),
        }
    }
    Some(parts.join("/"))
}
