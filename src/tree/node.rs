//! Tree nodes
//!
//! Every node lives in the tree's arena and is addressed by its inode number.
//! A hardlink is not a node of its own: the directory entry simply points at
//! the inode of the file it links to.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use crate::archive::BodyRange;
use crate::config::Owner;

/// Inode number, unique within one mount
pub type Ino = u64;

/// Inode of the root directory (FUSE_ROOT_ID)
pub const ROOT_INO: Ino = 1;

/// Preferred I/O block size reported for every node
const BLOCK_SIZE: u32 = 4096;

/// Special-file flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
    Fifo,
}

/// What a node is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Directory; children are bound by name to inode numbers
    Directory { children: BTreeMap<String, Ino> },
    /// Regular file backed by a byte range of the archive
    File { body: BodyRange },
    /// Symbolic link, resolved by the adapter and never by the tree
    Symlink { target: String },
    /// Device or fifo from the archive
    Device {
        kind: DeviceKind,
        major: u32,
        minor: u32,
    },
    /// Tombstone for a path deleted from a lower layer
    Whiteout,
}

/// Ownership, permissions and times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    /// Permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Seconds since the epoch
    pub mtime: u64,
}

/// A node in the tree
#[derive(Debug, Clone)]
pub struct Node {
    pub ino: Ino,
    /// Inode of the directory this node was created in; the root is its own parent
    pub parent: Ino,
    /// Name within the parent directory at creation time
    pub name: String,
    pub kind: NodeKind,
    pub meta: NodeMeta,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Number of directory entries referring to this node
    pub nlink: u32,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self.kind, NodeKind::Whiteout)
    }

    /// Short human-readable kind name
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Directory { .. } => "directory",
            NodeKind::File { .. } => "file",
            NodeKind::Symlink { .. } => "symlink",
            NodeKind::Device {
                kind: DeviceKind::Char,
                ..
            } => "chardev",
            NodeKind::Device {
                kind: DeviceKind::Block,
                ..
            } => "blockdev",
            NodeKind::Device {
                kind: DeviceKind::Fifo,
                ..
            } => "fifo",
            NodeKind::Whiteout => "whiteout",
        }
    }

    /// Children of a directory node
    pub fn children(&self) -> Option<&BTreeMap<String, Ino>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            _ => None,
        }
    }

    /// Size reported to the kernel
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { body } => body.size,
            NodeKind::Symlink { target } => target.len() as u64,
            _ => 0,
        }
    }

    /// Device numbers; whiteouts are (0, 0)
    pub fn device_numbers(&self) -> (u32, u32) {
        match &self.kind {
            NodeKind::Device { major, minor, .. } => (*major, *minor),
            _ => (0, 0),
        }
    }

    pub fn to_fuser_type(&self) -> fuser::FileType {
        match &self.kind {
            NodeKind::Directory { .. } => fuser::FileType::Directory,
            NodeKind::File { .. } => fuser::FileType::RegularFile,
            NodeKind::Symlink { .. } => fuser::FileType::Symlink,
            NodeKind::Device { kind, .. } => match kind {
                DeviceKind::Char => fuser::FileType::CharDevice,
                DeviceKind::Block => fuser::FileType::BlockDevice,
                DeviceKind::Fifo => fuser::FileType::NamedPipe,
            },
            NodeKind::Whiteout => fuser::FileType::CharDevice,
        }
    }

    /// Full `st_mode`, file type bits included
    pub fn st_mode(&self) -> u32 {
        let type_bits = match &self.kind {
            NodeKind::Directory { .. } => libc::S_IFDIR,
            NodeKind::File { .. } => libc::S_IFREG,
            NodeKind::Symlink { .. } => libc::S_IFLNK,
            NodeKind::Device { kind, .. } => match kind {
                DeviceKind::Char => libc::S_IFCHR,
                DeviceKind::Block => libc::S_IFBLK,
                DeviceKind::Fifo => libc::S_IFIFO,
            },
            NodeKind::Whiteout => libc::S_IFCHR,
        };
        type_bits as u32 | (self.meta.mode & 0o7777)
    }

    /// Convert to fuser FileAttr
    pub fn to_fuser_attr(&self, owner: Option<Owner>) -> fuser::FileAttr {
        let size = self.size();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(self.meta.mtime);
        let (major, minor) = self.device_numbers();
        let (uid, gid) = match owner {
            Some(owner) => (owner.uid, owner.gid),
            None => (self.meta.uid, self.meta.gid),
        };
        fuser::FileAttr {
            ino: self.ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: self.to_fuser_type(),
            perm: (self.meta.mode & 0o7777) as u16,
            nlink: self.nlink,
            uid,
            gid,
            rdev: encode_dev(major, minor),
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Encode a device number the way the kernel decodes `fuse_attr.rdev`
pub fn encode_dev(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12)
}
