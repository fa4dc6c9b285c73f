//! In-memory archive fixtures for unit tests

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::archive::{EntryParser, ReadAt};
use crate::config::ArchiveConfig;
use crate::tree::NodeTree;

/// One record to write into a fixture archive
pub(crate) struct TestEntry {
    name: String,
    entry_type: tar::EntryType,
    contents: Vec<u8>,
    link: Option<String>,
    device: Option<(u32, u32)>,
    mode: u32,
    owner: (u64, u64),
    blank_numbers: bool,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl TestEntry {
    fn new(name: &str, entry_type: tar::EntryType, mode: u32) -> Self {
        TestEntry {
            name: name.to_string(),
            entry_type,
            contents: Vec::new(),
            link: None,
            device: None,
            mode,
            owner: (0, 0),
            blank_numbers: false,
            xattrs: BTreeMap::new(),
        }
    }

    pub(crate) fn xattr(mut self, key: &str, value: &str) -> Self {
        self.xattrs.insert(key.to_string(), value.as_bytes().to_vec());
        self
    }

    pub(crate) fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn owner(mut self, uid: u64, gid: u64) -> Self {
        self.owner = (uid, gid);
        self
    }

    /// Leave uid, gid and mtime as NUL bytes, as some minimal writers do
    pub(crate) fn blank_numbers(mut self) -> Self {
        self.blank_numbers = true;
        self
    }
}

pub(crate) fn regfile(name: &str, contents: &str) -> TestEntry {
    let mut entry = TestEntry::new(name, tar::EntryType::Regular, 0o644);
    entry.contents = contents.as_bytes().to_vec();
    entry
}

pub(crate) fn directory(name: &str) -> TestEntry {
    assert!(name.ends_with('/'), "dir {:?} must end with /", name);
    TestEntry::new(name, tar::EntryType::Directory, 0o755)
}

pub(crate) fn hardlink(name: &str, target: &str) -> TestEntry {
    let mut entry = TestEntry::new(name, tar::EntryType::Link, 0o644);
    entry.link = Some(target.to_string());
    entry
}

pub(crate) fn symlink(name: &str, target: &str) -> TestEntry {
    let mut entry = TestEntry::new(name, tar::EntryType::Symlink, 0o777);
    entry.link = Some(target.to_string());
    entry
}

pub(crate) fn chardev(name: &str, major: u32, minor: u32) -> TestEntry {
    let mut entry = TestEntry::new(name, tar::EntryType::Char, 0o666);
    entry.device = Some((major, minor));
    entry
}

/// Serialize entries into a tar archive, verbatim and in order
pub(crate) fn tarfile(entries: Vec<TestEntry>) -> Bytes {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        if !entry.xattrs.is_empty() {
            let body = pax_records(&entry.xattrs);
            let mut header = tar::Header::new_ustar();
            set_raw(&mut header.as_old_mut().name, "PaxHeaders/entry");
            header.set_entry_type(tar::EntryType::XHeader);
            header.set_mode(0o644);
            header.set_size(body.len() as u64);
            header.set_cksum();
            builder.append(&header, body.as_slice()).unwrap();
        }

        let mut header = tar::Header::new_ustar();
        set_raw(&mut header.as_old_mut().name, &entry.name);
        if let Some(link) = &entry.link {
            set_raw(&mut header.as_old_mut().linkname, link);
        }
        header.set_entry_type(entry.entry_type);
        header.set_mode(entry.mode);
        if !entry.blank_numbers {
            header.set_uid(entry.owner.0);
            header.set_gid(entry.owner.1);
            header.set_mtime(0);
        }
        header.set_size(entry.contents.len() as u64);
        if let Some((major, minor)) = entry.device {
            header.set_device_major(major).unwrap();
            header.set_device_minor(minor).unwrap();
        }
        header.set_cksum();
        builder.append(&header, entry.contents.as_slice()).unwrap();
    }
    Bytes::from(builder.into_inner().unwrap())
}

/// Parse and build a tree from fixture entries
pub(crate) fn build_tree(entries: Vec<TestEntry>) -> crate::Result<NodeTree> {
    build_tree_with(entries, &ArchiveConfig::default())
}

pub(crate) fn build_tree_with(
    entries: Vec<TestEntry>,
    config: &ArchiveConfig,
) -> crate::Result<NodeTree> {
    let source: Arc<dyn ReadAt> = Arc::new(tarfile(entries));
    let mut parser = EntryParser::new(source.clone())?;
    NodeTree::build(parser.entries()?, source, config)
}

fn set_raw(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    assert!(bytes.len() <= field.len(), "{:?} too long for header", value);
    field[..bytes.len()].copy_from_slice(bytes);
}

fn pax_records(xattrs: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in xattrs {
        let key = format!("{}{}", crate::archive::PAX_XATTR_PREFIX, key);
        // "<len> <key>=<value>\n", where <len> counts its own digits.
        let rest = key.len() + value.len() + 3;
        let mut len = rest + 1;
        while len != rest + len.to_string().len() {
            len = rest + len.to_string().len();
        }
        body.extend_from_slice(format!("{} {}=", len, key).as_bytes());
        body.extend_from_slice(value);
        body.push(b'\n');
    }
    body
}
