//! OCI whiteout and opaque-directory markers

/// Prefix of a whiteout marker: `.wh.<name>` deletes `<name>`
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix reserved for overlay metadata entries
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Marker that makes its parent directory opaque
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Extended attribute overlayfs reads to detect an opaque directory
pub const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// Value of [`OPAQUE_XATTR`] on an opaque directory
pub const OPAQUE_XATTR_VALUE: &[u8] = b"y";

/// How an entry's base name is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// `.wh..wh..opq`
    Opaque,
    /// Any other `.wh..wh.*` name (e.g. AUFS `.wh..wh..plnk`), a bare `.wh.`,
    /// or a whiteout of `.` or `..`
    Reserved,
    /// `.wh.<name>`: a tombstone for `<name>`
    Whiteout(&'a str),
    /// An ordinary name
    Plain,
}

/// Classify a base name
pub fn classify(base: &str) -> Marker<'_> {
    if base == WHITEOUT_OPAQUE {
        return Marker::Opaque;
    }
    if base.starts_with(WHITEOUT_META_PREFIX) {
        return Marker::Reserved;
    }
    match base.strip_prefix(WHITEOUT_PREFIX) {
        Some("" | "." | "..") => Marker::Reserved,
        Some(name) => Marker::Whiteout(name),
        None => Marker::Plain,
    }
}
