//! Random-access backing store for archive bodies
//!
//! Regular file contents are never copied out of the archive. Each file keeps
//! a [`BodyRange`] into the source and reads are served positionally.

use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// Positional reads over an immutable byte source
pub trait ReadAt: Send + Sync {
    /// Read into `buf` starting at `offset`, returning the number of bytes read
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total length of the source in bytes
    fn len(&self) -> io::Result<u64>;
}

impl ReadAt for Bytes {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        read_slice_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(Bytes::len(self) as u64)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        read_slice_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(Vec::len(self) as u64)
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

fn read_slice_at(data: &[u8], buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}

/// Location of a regular file's body inside the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyRange {
    /// Absolute offset of the first body byte
    pub offset: u64,
    /// Body length in bytes
    pub size: u64,
}

impl BodyRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Read up to `len` bytes starting `offset` bytes into the body.
    ///
    /// Reads past the end of the body are clamped, so a short (or empty)
    /// result signals EOF.
    pub fn read(&self, source: &dyn ReadAt, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let want = (self.size - offset).min(len as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let pos = self.offset + offset + filled as u64;
            let n = source.read_at(&mut buf[filled..], pos)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("archive body truncated at offset {}", pos),
                ));
            }
            filled += n;
        }
        Ok(buf)
    }
}

/// `Read + Seek` view over a shared [`ReadAt`], as needed by the tar parser
pub struct SourceCursor {
    source: Arc<dyn ReadAt>,
    pos: u64,
}

impl SourceCursor {
    pub fn new(source: Arc<dyn ReadAt>) -> Self {
        Self { source, pos: 0 }
    }
}

impl Read for SourceCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SourceCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.source.len()?.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match next {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
