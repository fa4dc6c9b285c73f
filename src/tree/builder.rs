//! Tree construction with overlay marker translation
//!
//! Entries are applied one at a time in stream order. A later entry always
//! replaces an earlier binding of the same name, whether the earlier one was a
//! real file or a whiteout. Directories are the exception: a directory entry
//! over an existing directory only refreshes its metadata.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace};

use super::node::{DeviceKind, Ino, Node, NodeKind, NodeMeta, ROOT_INO};
use super::overlay::{self, Marker, OPAQUE_XATTR, OPAQUE_XATTR_VALUE};
use crate::archive::{Entry, EntryKind};
use crate::config::ArchiveConfig;
use crate::error::{Error, Result};

/// Mode given to directories created implicitly
const SYNTHESIZED_DIR_MODE: u32 = 0o755;

pub(crate) struct TreeBuilder<'a> {
    nodes: Vec<Node>,
    config: &'a ArchiveConfig,
}

impl<'a> TreeBuilder<'a> {
    pub(crate) fn new(config: &'a ArchiveConfig) -> Self {
        let root = Node {
            ino: ROOT_INO,
            parent: ROOT_INO,
            name: String::new(),
            kind: NodeKind::Directory {
                children: BTreeMap::new(),
            },
            meta: NodeMeta {
                mode: SYNTHESIZED_DIR_MODE,
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                mtime: 0,
            },
            xattrs: BTreeMap::new(),
            nlink: 2,
        };
        Self {
            nodes: vec![root],
            config,
        }
    }

    /// Apply one entry
    pub(crate) fn apply(&mut self, entry: Entry) -> Result<()> {
        trace!(path = %entry.path, kind = entry.kind.name(), "apply entry");

        if entry.path.is_empty() {
            return self.apply_root(entry);
        }

        let parent_path = entry.parent_path();
        match overlay::classify(entry.base_name()) {
            Marker::Opaque => {
                let dir = self.parent_dir(parent_path)?;
                debug!(dir = parent_path, "marking directory opaque");
                self.node_mut(dir)
                    .xattrs
                    .insert(OPAQUE_XATTR.to_string(), OPAQUE_XATTR_VALUE.to_vec());
                Ok(())
            }
            Marker::Reserved => {
                debug!(path = %entry.path, "discarding reserved overlay entry");
                Ok(())
            }
            Marker::Whiteout(name) => {
                let dir = self.parent_dir(parent_path)?;
                debug!(dir = parent_path, name, "installing whiteout");
                let meta = meta_of(&entry);
                let ino = self.alloc(dir, name, NodeKind::Whiteout, meta, BTreeMap::new());
                self.node_mut(ino).meta.mode = 0;
                self.bind(dir, name, ino);
                Ok(())
            }
            Marker::Plain => {
                let dir = self.parent_dir(parent_path)?;
                let name = entry.base_name().to_string();
                self.insert(dir, &name, entry)
            }
        }
    }

    /// Finish construction, returning the node arena.
    ///
    /// Link counts are taken from the final bindings. A node whose recorded
    /// name was replaced, or whose directory was, moves to its first binding
    /// still reachable from the root.
    pub(crate) fn finish(mut self) -> Vec<Node> {
        let bindings = self.reachable_bindings();
        let subdirs: Vec<Option<u32>> = self
            .nodes
            .iter()
            .map(|node| {
                node.children().map(|children| {
                    children
                        .values()
                        .filter(|&&c| self.nodes[index(c)].is_dir())
                        .count() as u32
                })
            })
            .collect();

        for ((node, mut bound), subdirs) in self.nodes.iter_mut().zip(bindings).zip(subdirs) {
            match subdirs {
                // Self, parent entry, and one per subdirectory.
                Some(subdirs) => node.nlink = 2 + subdirs,
                None => node.nlink = bound.len() as u32,
            }
            if node.ino == ROOT_INO || bound.is_empty() {
                continue;
            }
            if !bound
                .iter()
                .any(|(parent, name)| *parent == node.parent && *name == node.name)
            {
                let (parent, name) = bound.swap_remove(0);
                debug!(ino = node.ino, from = %node.name, to = %name, "rehoming node");
                node.parent = parent;
                node.name = name;
            }
        }
        self.nodes
    }

    /// Every (directory, name) binding of each node reachable from the root,
    /// breadth first
    fn reachable_bindings(&self) -> Vec<Vec<(Ino, String)>> {
        let mut bindings = vec![Vec::new(); self.nodes.len()];
        let mut queue = VecDeque::from([ROOT_INO]);
        while let Some(dir) = queue.pop_front() {
            let Some(children) = self.node(dir).children() else {
                continue;
            };
            for (name, &child) in children {
                bindings[index(child)].push((dir, name.clone()));
                if self.node(child).is_dir() {
                    queue.push_back(child);
                }
            }
        }
        bindings
    }

    fn apply_root(&mut self, entry: Entry) -> Result<()> {
        match entry.kind {
            EntryKind::Directory => {
                self.merge_dir(ROOT_INO, &entry);
                Ok(())
            }
            other => Err(Error::MalformedArchive(format!(
                "archive root entry is a {}, not a directory",
                other.name()
            ))),
        }
    }

    fn insert(&mut self, dir: Ino, name: &str, entry: Entry) -> Result<()> {
        let existing = self.child(dir, name);
        let meta = meta_of(&entry);

        let kind = match &entry.kind {
            EntryKind::Directory => {
                if let Some(ino) = existing.filter(|&ino| self.node(ino).is_dir()) {
                    self.merge_dir(ino, &entry);
                    return Ok(());
                }
                NodeKind::Directory {
                    children: BTreeMap::new(),
                }
            }
            EntryKind::Regular { body } => NodeKind::File { body: *body },
            EntryKind::Symlink { target } => NodeKind::Symlink {
                target: target.clone(),
            },
            EntryKind::Hardlink { target } => return self.link(dir, name, &entry.path, target),
            EntryKind::CharDevice { major, minor } => NodeKind::Device {
                kind: DeviceKind::Char,
                major: *major,
                minor: *minor,
            },
            EntryKind::BlockDevice { major, minor } => NodeKind::Device {
                kind: DeviceKind::Block,
                major: *major,
                minor: *minor,
            },
            EntryKind::Fifo => NodeKind::Device {
                kind: DeviceKind::Fifo,
                major: 0,
                minor: 0,
            },
        };

        let ino = self.alloc(dir, name, kind, meta, entry.xattrs);
        self.bind(dir, name, ino);
        Ok(())
    }

    fn link(&mut self, dir: Ino, name: &str, path: &str, target: &str) -> Result<()> {
        let target_ino = self.lookup(target).ok_or_else(|| {
            Error::MalformedArchive(format!(
                "hardlink {:?} points to missing entry {:?}",
                path, target
            ))
        })?;

        match self.node(target_ino).kind {
            NodeKind::File { .. } | NodeKind::Symlink { .. } | NodeKind::Device { .. } => {}
            _ => {
                return Err(Error::MalformedArchive(format!(
                    "hardlink {:?} points to a {}",
                    path,
                    self.node(target_ino).kind_name()
                )));
            }
        }

        if self.child(dir, name) == Some(target_ino) {
            return Ok(());
        }
        trace!(path, target, ino = target_ino, "linking");
        self.bind(dir, name, target_ino);
        Ok(())
    }

    /// Refresh metadata of an existing directory, keeping children and markers
    fn merge_dir(&mut self, ino: Ino, entry: &Entry) {
        let node = self.node_mut(ino);
        node.meta = meta_of(entry);
        node.xattrs
            .extend(entry.xattrs.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Resolve the directory an entry goes into
    fn parent_dir(&mut self, path: &str) -> Result<Ino> {
        let mut current = ROOT_INO;
        if path.is_empty() {
            return Ok(current);
        }
        for component in path.split('/') {
            current = match self.child(current, component) {
                Some(ino) if self.node(ino).is_dir() => ino,
                Some(ino) => {
                    return Err(Error::MalformedArchive(format!(
                        "parent {:?} is a {}, not a directory",
                        path,
                        self.node(ino).kind_name()
                    )));
                }
                None if self.config.synthesize_parents => {
                    debug!(dir = component, parent = current, "synthesizing directory");
                    let meta = NodeMeta {
                        mode: SYNTHESIZED_DIR_MODE,
                        ..self.node(current).meta
                    };
                    let kind = NodeKind::Directory {
                        children: BTreeMap::new(),
                    };
                    let ino = self.alloc(current, component, kind, meta, BTreeMap::new());
                    self.bind(current, component, ino);
                    ino
                }
                None => {
                    return Err(Error::MalformedArchive(format!(
                        "parent directory {:?} does not precede its entries",
                        path
                    )));
                }
            };
        }
        Ok(current)
    }

    fn lookup(&self, path: &str) -> Option<Ino> {
        let mut current = ROOT_INO;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.child(current, component)?;
        }
        Some(current)
    }

    fn child(&self, dir: Ino, name: &str) -> Option<Ino> {
        self.node(dir).children()?.get(name).copied()
    }

    fn alloc(
        &mut self,
        parent: Ino,
        name: &str,
        kind: NodeKind,
        meta: NodeMeta,
        xattrs: BTreeMap<String, Vec<u8>>,
    ) -> Ino {
        let ino = self.nodes.len() as Ino + 1;
        self.nodes.push(Node {
            ino,
            parent,
            name: name.to_string(),
            kind,
            meta,
            xattrs,
            nlink: 1,
        });
        ino
    }

    /// Bind `name` in `dir` to `ino`, replacing any previous binding
    fn bind(&mut self, dir: Ino, name: &str, ino: Ino) {
        let previous = match &mut self.node_mut(dir).kind {
            NodeKind::Directory { children } => children.insert(name.to_string(), ino),
            _ => None,
        };
        if let Some(old) = previous.filter(|&old| old != ino) {
            trace!(name, old, new = ino, "replacing binding");
        }
    }

    fn node(&self, ino: Ino) -> &Node {
        &self.nodes[index(ino)]
    }

    fn node_mut(&mut self, ino: Ino) -> &mut Node {
        &mut self.nodes[index(ino)]
    }
}

fn index(ino: Ino) -> usize {
    (ino - 1) as usize
}

fn meta_of(entry: &Entry) -> NodeMeta {
    NodeMeta {
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        mtime: entry.mtime,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ArchiveConfig;
    use crate::error::Error;
    use crate::testutil::{build_tree, build_tree_with, directory, hardlink, regfile};
    use crate::tree::{NodeKind, NodeTree, OPAQUE_XATTR};

    fn assert_whiteout(tree: &NodeTree, path: &str) {
        let node = tree.lookup(path).unwrap();
        assert!(node.is_whiteout(), "{} is a {}", path, node.kind_name());
        let attr = node.to_fuser_attr(None);
        assert_eq!(attr.kind, fuser::FileType::CharDevice);
        assert_eq!(attr.rdev, 0);
        assert_eq!(node.device_numbers(), (0, 0));
        assert_eq!(node.st_mode() & libc::S_IFMT as u32, libc::S_IFCHR as u32);

        // Directory entry and node agree on the inode.
        let (parent, base) = crate::archive::split_parent(path);
        let dir = tree.lookup(parent).unwrap();
        let listed = tree.list_directory(dir.ino).unwrap();
        let (_, listed_node) = listed.iter().find(|(n, _)| *n == base).unwrap();
        assert_eq!(listed_node.ino, node.ino);
    }

    fn assert_not_exist(tree: &NodeTree, path: &str) {
        assert!(matches!(tree.lookup(path), Err(Error::NotFound(_))));
        let (parent, base) = crate::archive::split_parent(path);
        if let Ok(dir) = tree.lookup(parent) {
            let listed = tree.list_directory(dir.ino).unwrap();
            assert!(listed.iter().all(|(n, _)| *n != base), "{} is listed", path);
        }
    }

    fn assert_contents(tree: &NodeTree, path: &str, want: &str) {
        let node = tree.lookup(path).unwrap();
        let data = tree.read_range(node.ino, 0, node.size() as usize + 10).unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), want);
    }

    fn assert_xattr(tree: &NodeTree, path: &str, key: &str, value: &str) {
        let node = tree.lookup(path).unwrap();
        let xattrs = tree.xattrs(node.ino).unwrap();
        assert_eq!(
            xattrs.get(key).map(Vec::as_slice),
            Some(value.as_bytes()),
            "xattr {} on {}",
            key,
            path
        );
    }

    #[test]
    fn test_whiteout_with_sibling() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/bar.txt", ""),
            regfile("foo/.wh.foo.txt", ""),
        ])
        .unwrap();

        assert_whiteout(&tree, "foo/foo.txt");
        assert_not_exist(&tree, "foo/.wh.foo.txt");
        assert_contents(&tree, "foo/bar.txt", "");
    }

    #[test]
    fn test_whiteout_after_file_wins() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/bar.txt", "test"),
            regfile("foo/.wh.bar.txt", ""),
        ])
        .unwrap();

        assert_whiteout(&tree, "foo/bar.txt");
        assert_not_exist(&tree, "foo/.wh.bar.txt");
        let node = tree.lookup("foo/bar.txt").unwrap();
        assert!(matches!(
            tree.read_range(node.ino, 0, 4),
            Err(Error::NotReadable { .. })
        ));
    }

    #[test]
    fn test_file_after_whiteout_reappears() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/.wh.bar.txt", ""),
            regfile("foo/bar.txt", "test"),
        ])
        .unwrap();

        assert_contents(&tree, "foo/bar.txt", "test");
        assert_not_exist(&tree, "foo/.wh.bar.txt");
    }

    #[test]
    fn test_whiteout_replaces_directory() {
        let tree = build_tree(vec![
            directory("foo/"),
            directory("foo/sub/"),
            regfile("foo/sub/a.txt", "a"),
            regfile("foo/.wh.sub", ""),
        ])
        .unwrap();

        assert_whiteout(&tree, "foo/sub");
        assert!(tree.lookup("foo/sub/a.txt").is_err());
    }

    #[test]
    fn test_opaque() {
        let tree = build_tree(vec![directory("foo/"), regfile("foo/.wh..wh..opq", "")]).unwrap();

        assert_xattr(&tree, "foo", OPAQUE_XATTR, "y");
        assert_not_exist(&tree, "foo/.wh..wh..opq");
    }

    #[test]
    fn test_opaque_with_sibling() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/.wh..wh..opq", ""),
            regfile("foo/bar.txt", "test"),
        ])
        .unwrap();

        assert_xattr(&tree, "foo", OPAQUE_XATTR, "y");
        assert_contents(&tree, "foo/bar.txt", "test");
        assert_not_exist(&tree, "foo/.wh..wh..opq");
    }

    #[test]
    fn test_opaque_keeps_earlier_siblings() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/bar.txt", "test"),
            regfile("foo/.wh..wh..opq", ""),
        ])
        .unwrap();

        assert_xattr(&tree, "foo", OPAQUE_XATTR, "y");
        assert_contents(&tree, "foo/bar.txt", "test");
    }

    #[test]
    fn test_opaque_with_xattr() {
        let tree = build_tree(vec![
            directory("foo/").xattr("foo", "bar"),
            regfile("foo/.wh..wh..opq", ""),
        ])
        .unwrap();

        assert_xattr(&tree, "foo", OPAQUE_XATTR, "y");
        assert_xattr(&tree, "foo", "foo", "bar");
        assert_not_exist(&tree, "foo/.wh..wh..opq");
    }

    #[test]
    fn test_opaque_at_root() {
        let tree = build_tree(vec![regfile(".wh..wh..opq", "")]).unwrap();
        assert_xattr(&tree, "", OPAQUE_XATTR, "y");
    }

    #[test]
    fn test_reserved_marker_discarded() {
        let tree = build_tree(vec![
            directory("foo/"),
            directory("foo/.wh..wh..plnk/"),
        ])
        .unwrap();

        assert_not_exist(&tree, "foo/.wh..wh..plnk");
        assert!(tree.list_directory(tree.lookup("foo").unwrap().ino).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_directory_keeps_children_and_opaque() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/.wh..wh..opq", ""),
            regfile("foo/a.txt", "a"),
            directory("foo/").mode(0o700).xattr("user.k", "v"),
        ])
        .unwrap();

        assert_contents(&tree, "foo/a.txt", "a");
        assert_xattr(&tree, "foo", OPAQUE_XATTR, "y");
        assert_xattr(&tree, "foo", "user.k", "v");
        assert_eq!(tree.lookup("foo").unwrap().meta.mode, 0o700);
    }

    #[test]
    fn test_later_file_replaces_earlier() {
        let tree = build_tree(vec![regfile("a.txt", "old"), regfile("a.txt", "new!")]).unwrap();
        assert_contents(&tree, "a.txt", "new!");
    }

    #[test]
    fn test_hardlink_shares_node() {
        let tree = build_tree(vec![
            regfile("baz.txt", "baz"),
            hardlink("bar.txt", "baz.txt"),
        ])
        .unwrap();

        let target = tree.lookup("baz.txt").unwrap();
        let link = tree.lookup("bar.txt").unwrap();
        assert_eq!(link.ino, target.ino);
        assert_eq!(target.nlink, 2);
        assert!(matches!(target.kind, NodeKind::File { .. }));
        assert_contents(&tree, "bar.txt", "baz");
        assert_eq!(tree.path_of(link.ino), "baz.txt");
    }

    #[test]
    fn test_hardlink_to_missing_target() {
        let result = build_tree(vec![hardlink("bar.txt", "nope.txt")]);
        assert!(matches!(result, Err(Error::MalformedArchive(_))));
    }

    #[test]
    fn test_hardlink_to_directory_rejected() {
        let result = build_tree(vec![directory("foo/"), hardlink("bar", "foo")]);
        assert!(matches!(result, Err(Error::MalformedArchive(_))));
    }

    #[test]
    fn test_replaced_link_drops_count() {
        let tree = build_tree(vec![
            regfile("baz.txt", "baz"),
            hardlink("bar.txt", "baz.txt"),
            regfile(".wh.bar.txt", ""),
        ])
        .unwrap();

        assert_eq!(tree.lookup("baz.txt").unwrap().nlink, 1);
        assert_whiteout(&tree, "bar.txt");
    }

    fn assert_canonical(tree: &NodeTree, path: &str, canonical: &str) {
        let node = tree.lookup(path).unwrap();
        assert_eq!(tree.path_of(node.ino), canonical);
        assert_eq!(tree.lookup(canonical).unwrap().ino, node.ino);
    }

    #[test]
    fn test_whiteout_of_link_origin_moves_path() {
        let tree = build_tree(vec![
            regfile("a.txt", "abc"),
            hardlink("b.txt", "a.txt"),
            regfile(".wh.a.txt", ""),
        ])
        .unwrap();

        assert_whiteout(&tree, "a.txt");
        assert_canonical(&tree, "b.txt", "b.txt");
        assert_eq!(tree.lookup("b.txt").unwrap().nlink, 1);
        assert_contents(&tree, "b.txt", "abc");
    }

    #[test]
    fn test_replaced_link_origin_moves_path() {
        let tree = build_tree(vec![
            regfile("a.txt", "abc"),
            hardlink("b.txt", "a.txt"),
            hardlink("c.txt", "a.txt"),
            regfile("a.txt", "new"),
        ])
        .unwrap();

        assert_contents(&tree, "a.txt", "new");
        assert_canonical(&tree, "a.txt", "a.txt");
        assert_canonical(&tree, "c.txt", "b.txt");
        assert_eq!(tree.lookup("b.txt").unwrap().nlink, 2);
    }

    #[test]
    fn test_whiteout_of_link_directory_moves_path() {
        let tree = build_tree(vec![
            directory("d/"),
            regfile("d/f", "abc"),
            hardlink("g", "d/f"),
            regfile(".wh.d", ""),
        ])
        .unwrap();

        assert!(tree.lookup("d/f").is_err());
        assert_canonical(&tree, "g", "g");
        assert_eq!(tree.lookup("g").unwrap().nlink, 1);
    }

    #[test]
    fn test_link_origin_kept_when_alive() {
        let tree = build_tree(vec![
            directory("d/"),
            regfile("d/f", "abc"),
            hardlink("a", "d/f"),
        ])
        .unwrap();

        assert_canonical(&tree, "a", "d/f");
    }

    #[test]
    fn test_dot_whiteouts_discarded() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/.wh..", ""),
            regfile("foo/.wh...", ""),
        ])
        .unwrap();

        let foo = tree.lookup("foo").unwrap();
        assert!(tree.list_directory(foo.ino).unwrap().is_empty());
    }

    #[test]
    fn test_missing_parent_fails() {
        let result = build_tree(vec![regfile("foo/bar.txt", "x")]);
        assert!(matches!(result, Err(Error::MalformedArchive(_))));
    }

    #[test]
    fn test_parent_is_file_fails() {
        let result = build_tree(vec![regfile("foo", "x"), regfile("foo/bar.txt", "x")]);
        assert!(matches!(result, Err(Error::MalformedArchive(_))));
    }

    #[test]
    fn test_synthesized_parents() {
        let config = ArchiveConfig {
            synthesize_parents: true,
        };
        let tree = build_tree_with(vec![regfile("a/b/c.txt", "abc")], &config).unwrap();

        assert!(tree.lookup("a").unwrap().is_dir());
        assert!(tree.lookup("a/b").unwrap().is_dir());
        assert_eq!(tree.lookup("a/b").unwrap().meta.mode, 0o755);
        assert_contents(&tree, "a/b/c.txt", "abc");
    }

    #[test]
    fn test_inodes_unique() {
        let tree = build_tree(vec![
            directory("foo/"),
            regfile("foo/a", "1"),
            regfile("foo/a", "2"),
            regfile("foo/.wh.a", ""),
        ])
        .unwrap();

        let mut seen = std::collections::HashSet::new();
        for node in tree.iter() {
            assert!(seen.insert(node.ino));
        }
        // root + foo + two files + whiteout
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn test_directory_link_count() {
        let tree = build_tree(vec![
            directory("foo/"),
            directory("foo/a/"),
            directory("foo/b/"),
            regfile("foo/c", ""),
        ])
        .unwrap();

        assert_eq!(tree.lookup("foo").unwrap().nlink, 4);
        assert_eq!(tree.root().nlink, 3);
    }
}
