//! Archive input
//!
//! Turns a tar byte stream into an ordered sequence of typed [`Entry`] values.
//! This layer knows nothing about whiteouts or the filesystem tree.

mod entry;
mod parser;
mod source;

pub use entry::{normalize_path, split_parent, Entry, EntryKind};
pub use parser::{Entries, EntryParser, PAX_XATTR_PREFIX};
pub use source::{BodyRange, ReadAt, SourceCursor};
