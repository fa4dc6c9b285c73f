//! Read-only FUSE filesystem over a [`NodeTree`]
//!
//! Every operation is implemented as a `&self` method returning [`Result`];
//! the [`Filesystem`] impl at the bottom only translates between those
//! methods and fuser replies. Successful opens and reads of regular files are
//! reported to the [`Monitor`] under the canonical path of the backing node.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::handle::{wants_write, HandleManager};
use crate::config::{Config, Owner};
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::tree::{Ino, NodeKind, NodeTree};

const BLOCK_SIZE: u32 = 4096;
const MAX_NAME_LEN: u32 = 255;

/// FUSE filesystem serving an immutable tree
pub struct TarFs {
    tree: Arc<NodeTree>,
    monitor: Arc<dyn Monitor>,
    handles: HandleManager,
    attr_ttl: Duration,
    entry_ttl: Duration,
    owner: Option<Owner>,
}

impl TarFs {
    pub fn new(tree: Arc<NodeTree>, monitor: Arc<dyn Monitor>, config: &Config) -> Self {
        Self {
            tree,
            monitor,
            handles: HandleManager::new(),
            attr_ttl: config.cache.attr_timeout(),
            entry_ttl: config.cache.entry_timeout(),
            owner: config.mount.owner,
        }
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// Number of files currently open
    pub fn open_files(&self) -> usize {
        self.handles.open_count()
    }

    /// Look up `name` in directory `parent`
    pub fn lookup_child(&self, parent: Ino, name: &str) -> Result<FileAttr> {
        let node = self.tree.lookup_child(parent, name)?;
        Ok(node.to_fuser_attr(self.owner))
    }

    pub fn attr(&self, ino: Ino) -> Result<FileAttr> {
        Ok(self.tree.node(ino)?.to_fuser_attr(self.owner))
    }

    /// Target of a symlink, as stored in the archive
    pub fn readlink(&self, ino: Ino) -> Result<String> {
        match &self.tree.node(ino)?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(Error::InvalidArgument(format!(
                "{} is not a symlink",
                self.tree.path_of(ino)
            ))),
        }
    }

    /// Open a regular file for reading and return its handle
    pub fn open(&self, ino: Ino, flags: i32) -> Result<u64> {
        if wants_write(flags) {
            return Err(Error::ReadOnly);
        }
        let node = self.tree.node(ino)?;
        match node.kind {
            NodeKind::File { .. } => {
                let fh = self.handles.open(ino);
                self.monitor.on_open(&self.tree.path_of(ino));
                Ok(fh)
            }
            _ => Err(Error::NotReadable {
                path: self.tree.path_of(ino),
                kind: node.kind_name(),
            }),
        }
    }

    /// Resolve `path` from the root, following symlinks, and open the node it
    /// lands on. Returns the backing inode and the new handle.
    pub fn open_path(&self, path: &str, flags: i32) -> Result<(Ino, u64)> {
        let ino = self.tree.resolve(path, true)?.ino;
        let fh = self.open(ino, flags)?;
        Ok((ino, fh))
    }

    /// Read from an open file.
    ///
    /// The inode recorded in the handle takes precedence; an unknown handle
    /// falls back to `ino`.
    pub fn read(&self, ino: Ino, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let target = self.handles.get(fh).map(|h| h.ino).unwrap_or(ino);
        let data = self.tree.read_range(target, offset, size as usize)?;
        self.monitor.on_read(&self.tree.path_of(target));
        Ok(data)
    }

    pub fn release(&self, fh: u64) {
        self.handles.close(fh);
    }

    pub fn open_dir(&self, ino: Ino) -> Result<()> {
        let node = self.tree.node(ino)?;
        if node.is_dir() {
            Ok(())
        } else {
            Err(Error::NotADirectory(self.tree.path_of(ino)))
        }
    }

    /// Directory listing including `.` and `..`
    pub fn read_dir(&self, ino: Ino) -> Result<Vec<(Ino, FileType, String)>> {
        let dir = self.tree.node(ino)?;
        let children = self.tree.list_directory(ino)?;

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((dir.parent, FileType::Directory, "..".to_string()));
        entries.extend(
            children
                .into_iter()
                .map(|(name, node)| (node.ino, node.to_fuser_type(), name.to_string())),
        );
        Ok(entries)
    }

    /// Extended attribute names, each NUL-terminated
    pub fn xattr_names(&self, ino: Ino) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for name in self.tree.xattrs(ino)?.keys() {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        Ok(data)
    }

    pub fn xattr(&self, ino: Ino, name: &str) -> Result<Vec<u8>> {
        self.tree
            .xattrs(ino)?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoAttribute(name.to_string()))
    }

    /// Check access; any write request is refused
    pub fn access(&self, ino: Ino, mask: i32) -> Result<()> {
        self.tree.node(ino)?;
        if mask & libc::W_OK != 0 {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Total blocks and inode count
    fn usage(&self) -> (u64, u64) {
        let bytes: u64 = self
            .tree
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::File { .. }))
            .map(|n| n.size())
            .sum();
        (bytes.div_ceil(BLOCK_SIZE as u64), self.tree.node_count() as u64)
    }
}

fn name_str(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or_else(|| Error::NotFound(name.to_string_lossy().into_owned()))
}

impl Filesystem for TarFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match name_str(name).and_then(|name| self.lookup_child(parent, name)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.attr(ino) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match TarFs::readlink(self, ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={}, flags={})", ino, flags);

        match self.open_dir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.read_dir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, (child_ino, file_type, name)) in
            entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*child_ino, (i + 1) as i64, *file_type, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        match TarFs::open(self, ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match TarFs::read(self, ino, fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e @ Error::Io(_)) => {
                error!("Failed to read inode {} from archive: {}", ino, e);
                reply.error(e.errno());
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        TarFs::release(self, fh);
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        let value = match name.to_str() {
            Some(name) => self.xattr(ino, name),
            None => Err(Error::NoAttribute(name.to_string_lossy().into_owned())),
        };
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        if size == 0 {
            reply.size(value.len() as u32);
        } else if (size as usize) < value.len() {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&value);
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        let listing = match self.xattr_names(ino) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        if size == 0 {
            reply.size(listing.len() as u32);
        } else if (size as usize) < listing.len() {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&listing);
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match TarFs::access(self, ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let (blocks, files) = self.usage();
        reply.statfs(
            blocks,
            0, // bfree
            0, // bavail
            files,
            0, // ffree
            BLOCK_SIZE,
            MAX_NAME_LEN,
            BLOCK_SIZE,
        );
    }
}
