//! Streaming tar entry parser
//!
//! Walks the archive once, in stream order, skipping over bodies with seeks.
//! Regular files come out as a [`BodyRange`] into the source rather than a
//! copy of their contents.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use tar::{Archive, EntryType};
use tracing::{debug, trace, warn};

use super::entry::{normalize_path, Entry, EntryKind};
use super::source::{BodyRange, ReadAt, SourceCursor};
use crate::error::{Error, Result};

/// PAX record prefix carrying extended attributes
pub const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Single-pass parser over an archive source
pub struct EntryParser {
    archive: Archive<SourceCursor>,
    len: u64,
}

impl EntryParser {
    pub fn new(source: Arc<dyn ReadAt>) -> Result<Self> {
        let len = source.len()?;
        Ok(Self {
            archive: Archive::new(SourceCursor::new(source)),
            len,
        })
    }

    /// Lazy iterator over the archive's entries.
    ///
    /// Iteration stops after the first error.
    pub fn entries(&mut self) -> Result<Entries<'_>> {
        let inner = self.archive.entries_with_seek().map_err(malformed)?;
        Ok(Entries {
            inner,
            len: self.len,
            failed: false,
        })
    }
}

/// Iterator returned by [`EntryParser::entries`]
pub struct Entries<'a> {
    inner: tar::Entries<'a, SourceCursor>,
    len: u64,
    failed: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let raw = match self.inner.next()? {
                Ok(raw) => raw,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(malformed(e)));
                }
            };
            match convert(raw, self.len) {
                Ok(Some(entry)) => {
                    trace!(path = %entry.path, kind = entry.kind.name(), "parsed entry");
                    return Some(Ok(entry));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn malformed(e: io::Error) -> Error {
    Error::MalformedArchive(e.to_string())
}

fn convert(mut raw: tar::Entry<'_, SourceCursor>, len: u64) -> Result<Option<Entry>> {
    let raw_path = raw.path().map_err(malformed)?.to_string_lossy().into_owned();
    let entry_type = raw.header().entry_type();

    let kind = match entry_type {
        EntryType::Regular | EntryType::Continuous => {
            let body = BodyRange::new(raw.raw_file_position(), raw.size());
            if body.offset.saturating_add(body.size) > len {
                return Err(Error::MalformedArchive(format!(
                    "body of {:?} is truncated: declares {} bytes at offset {}, archive is {} bytes",
                    raw_path, body.size, body.offset, len
                )));
            }
            EntryKind::Regular { body }
        }
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink {
            target: link_name(&raw, &raw_path)?,
        },
        EntryType::Link => {
            let target = link_name(&raw, &raw_path)?;
            let target = normalize_path(&target).ok_or_else(|| {
                Error::MalformedArchive(format!(
                    "hardlink {:?} escapes the archive root: {:?}",
                    raw_path, target
                ))
            })?;
            EntryKind::Hardlink { target }
        }
        EntryType::Char => {
            let (major, minor) = device_numbers(raw.header())?;
            EntryKind::CharDevice { major, minor }
        }
        EntryType::Block => {
            let (major, minor) = device_numbers(raw.header())?;
            EntryKind::BlockDevice { major, minor }
        }
        EntryType::Fifo => EntryKind::Fifo,
        EntryType::GNUSparse => {
            return Err(Error::MalformedArchive(format!(
                "sparse entry {:?} is not supported",
                raw_path
            )));
        }
        EntryType::XGlobalHeader => {
            debug!("skipping pax global header");
            return Ok(None);
        }
        other => {
            warn!(path = %raw_path, entry_type = ?other, "skipping unsupported entry type");
            return Ok(None);
        }
    };

    let path = normalize_path(&raw_path).ok_or_else(|| {
        Error::MalformedArchive(format!("path escapes the archive root: {:?}", raw_path))
    })?;

    let header = raw.header();
    let old = header.as_old();
    let mode = header.mode().map_err(malformed)? & 0o7777;
    let uid = id_field(&old.uid, header.uid(), "uid", &raw_path)?;
    let gid = id_field(&old.gid, header.gid(), "gid", &raw_path)?;
    let mtime = numeric_field(&old.mtime, header.mtime())?;

    let xattrs = read_xattrs(&mut raw)?;

    Ok(Some(Entry {
        path,
        kind,
        mode,
        uid,
        gid,
        mtime,
        xattrs,
    }))
}

/// A numeric header field, reading a blank (all NUL or space) field as 0
fn numeric_field(raw: &[u8], value: io::Result<u64>) -> Result<u64> {
    if raw.iter().all(|&b| b == 0 || b == b' ') {
        return Ok(0);
    }
    value.map_err(malformed)
}

fn id_field(raw: &[u8], value: io::Result<u64>, field: &str, path: &str) -> Result<u32> {
    let id = numeric_field(raw, value)?;
    u32::try_from(id).map_err(|_| {
        Error::MalformedArchive(format!("{} {} of {:?} does not fit in 32 bits", field, id, path))
    })
}

fn link_name(raw: &tar::Entry<'_, SourceCursor>, path: &str) -> Result<String> {
    match raw.link_name().map_err(malformed)? {
        Some(target) => Ok(target.to_string_lossy().into_owned()),
        None => Err(Error::MalformedArchive(format!(
            "link {:?} has no target",
            path
        ))),
    }
}

fn device_numbers(header: &tar::Header) -> Result<(u32, u32)> {
    let major = header.device_major().map_err(malformed)?.unwrap_or(0);
    let minor = header.device_minor().map_err(malformed)?.unwrap_or(0);
    Ok((major, minor))
}

fn read_xattrs(raw: &mut tar::Entry<'_, SourceCursor>) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut xattrs = BTreeMap::new();
    if let Some(extensions) = raw.pax_extensions().map_err(malformed)? {
        for extension in extensions {
            let extension = extension.map_err(malformed)?;
            let Ok(key) = extension.key() else {
                continue;
            };
            if let Some(name) = key.strip_prefix(PAX_XATTR_PREFIX) {
                xattrs.insert(name.to_string(), extension.value_bytes().to_vec());
            }
        }
    }
    Ok(xattrs)
}
