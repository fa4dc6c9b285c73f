//! In-memory filesystem tree
//!
//! Built once from the archive's entries and immutable afterwards, so it can
//! be shared between FUSE worker threads without locking.

mod builder;
mod node;
mod overlay;

pub use node::{encode_dev, DeviceKind, Ino, Node, NodeKind, NodeMeta, ROOT_INO};
pub use overlay::{
    classify, Marker, OPAQUE_XATTR, OPAQUE_XATTR_VALUE, WHITEOUT_META_PREFIX, WHITEOUT_OPAQUE,
    WHITEOUT_PREFIX,
};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::archive::{Entry, ReadAt};
use crate::config::ArchiveConfig;
use crate::error::{Error, Result};
use builder::TreeBuilder;

/// Maximum symlinks followed while resolving one path
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Immutable tree of nodes backed by an archive
pub struct NodeTree {
    nodes: Vec<Node>,
    source: Arc<dyn ReadAt>,
}

impl NodeTree {
    /// Build the tree from entries in stream order.
    ///
    /// Fails on the first malformed entry; no partial tree is returned.
    pub fn build<I>(entries: I, source: Arc<dyn ReadAt>, config: &ArchiveConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Entry>>,
    {
        let mut builder = TreeBuilder::new(config);
        for entry in entries {
            builder.apply(entry?)?;
        }
        let nodes = builder.finish();
        debug!(nodes = nodes.len(), "tree built");
        Ok(Self { nodes, source })
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn get(&self, ino: Ino) -> Option<&Node> {
        let index = usize::try_from(ino.checked_sub(1)?).ok()?;
        self.nodes.get(index)
    }

    /// Like [`NodeTree::get`], failing with `NotFound`
    pub fn node(&self, ino: Ino) -> Result<&Node> {
        self.get(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    /// Number of nodes, including ones no longer reachable by name
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes in inode order
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Resolve `name` inside directory `parent`
    pub fn lookup_child(&self, parent: Ino, name: &str) -> Result<&Node> {
        let dir = self.node(parent)?;
        let children = dir
            .children()
            .ok_or_else(|| Error::NotADirectory(self.path_of(parent)))?;
        match children.get(name) {
            Some(&ino) => self.node(ino),
            None => Err(Error::NotFound(join(&self.path_of(parent), name))),
        }
    }

    /// Resolve a slash-separated path from the root without following symlinks
    pub fn lookup(&self, path: &str) -> Result<&Node> {
        let mut node = self.root();
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            node = self.lookup_child(node.ino, component)?;
        }
        Ok(node)
    }

    /// Resolve a path, following symlinks in intermediate components and,
    /// if `follow` is set, in the final one.
    ///
    /// Relative targets resolve against the link's directory, absolute
    /// targets against the root.
    pub fn resolve(&self, path: &str, follow: bool) -> Result<&Node> {
        let mut pending: VecDeque<String> = components(path).collect();
        let mut current = ROOT_INO;
        let mut hops = 0;

        while let Some(component) = pending.pop_front() {
            if component == ".." {
                current = self.node(current)?.parent;
                continue;
            }
            let child = self.lookup_child(current, &component)?;
            if let NodeKind::Symlink { target } = &child.kind {
                if follow || !pending.is_empty() {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(Error::SymlinkLoop(path.to_string()));
                    }
                    if target.starts_with('/') {
                        current = ROOT_INO;
                    }
                    let mut expanded: VecDeque<String> = components(target).collect();
                    expanded.extend(pending);
                    pending = expanded;
                    continue;
                }
            }
            current = child.ino;
        }
        self.node(current)
    }

    /// Visible children of a directory, sorted by name.
    ///
    /// Whiteouts show up as tombstones under the name they shadow; marker
    /// entries never appear.
    pub fn list_directory(&self, ino: Ino) -> Result<Vec<(&str, &Node)>> {
        let dir = self.node(ino)?;
        let children = dir
            .children()
            .ok_or_else(|| Error::NotADirectory(self.path_of(ino)))?;
        children
            .iter()
            .map(|(name, &child)| Ok((name.as_str(), self.node(child)?)))
            .collect()
    }

    /// Read up to `len` bytes of a regular file starting at `offset`
    pub fn read_range(&self, ino: Ino, offset: u64, len: usize) -> Result<Vec<u8>> {
        let node = self.node(ino)?;
        match &node.kind {
            NodeKind::File { body } => Ok(body.read(self.source.as_ref(), offset, len)?),
            _ => Err(Error::NotReadable {
                path: self.path_of(ino),
                kind: node.kind_name(),
            }),
        }
    }

    /// A node's own extended attributes, including the opaque marker on directories
    pub fn xattrs(&self, ino: Ino) -> Result<&BTreeMap<String, Vec<u8>>> {
        Ok(&self.node(ino)?.xattrs)
    }

    /// Canonical path of a node: where it was created, without a leading slash
    pub fn path_of(&self, ino: Ino) -> String {
        let mut names = Vec::new();
        let mut current = ino;
        while current != ROOT_INO {
            match self.get(current) {
                Some(node) => {
                    names.push(node.name.as_str());
                    current = node.parent;
                }
                None => break,
            }
        }
        names.reverse();
        names.join("/")
    }

    /// Every reachable path with its node, parents before children, in name order.
    ///
    /// A hardlinked node appears once per name.
    pub fn walk(&self) -> Vec<(String, &Node)> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), self.root())];
        while let Some((path, node)) = stack.pop() {
            if let Some(children) = node.children() {
                for (name, &child) in children.iter().rev() {
                    if let Some(child) = self.get(child) {
                        stack.push((join(&path, name), child));
                    }
                }
            }
            out.push((path, node));
        }
        out
    }
}

fn components(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}
