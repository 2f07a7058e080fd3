use std::fs::File;
use std::io;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use ntuple_error::ntuple_err;

/// A trait for types that support blocking positional reads.
///
/// References to the type must be safe to [share across threads][Send], since a page source
/// may be loading clusters on a background thread while its owner populates pages.
pub trait ReadAt: Send + Sync {
    /// Request a positional read. Results will be returned as a [`Bytes`].
    ///
    /// If the reader does not have the requested number of bytes, the read fails
    /// with an [`UnexpectedEof`][std::io::ErrorKind::UnexpectedEof].
    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes>;

    /// Read several ranges in one request.
    ///
    /// Backends that support vectored reads should override this; the default issues one
    /// read per range, in order.
    fn read_byte_ranges(&self, ranges: &[Range<u64>]) -> io::Result<Vec<Bytes>> {
        ranges
            .iter()
            .map(|r| self.read_byte_range(r.clone()))
            .collect()
    }

    fn performance_hint(&self) -> PerformanceHint {
        PerformanceHint::default()
    }

    /// Get the number of bytes of data readable.
    ///
    /// For a file it will be the size in bytes, for an in-memory buffer its length.
    fn size(&self) -> io::Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceHint {
    coalescing_window: u64,
}

impl Default for PerformanceHint {
    fn default() -> Self {
        Self {
            coalescing_window: 1 << 20, // 1MB
        }
    }
}

impl PerformanceHint {
    pub fn new(coalescing_window: u64) -> Self {
        Self { coalescing_window }
    }

    /// Creates a new instance that never merges reads, appropriate when every request is free.
    pub fn no_coalescing() -> Self {
        Self::new(0)
    }

    /// The maximum distance between two reads that should coalesced into a single operation.
    pub fn coalescing_window(&self) -> u64 {
        self.coalescing_window
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        T::read_byte_range(self, range)
    }

    fn read_byte_ranges(&self, ranges: &[Range<u64>]) -> io::Result<Vec<Bytes>> {
        T::read_byte_ranges(self, ranges)
    }

    fn performance_hint(&self) -> PerformanceHint {
        T::performance_hint(self)
    }

    fn size(&self) -> io::Result<u64> {
        T::size(self)
    }
}

impl ReadAt for Bytes {
    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let (start, end) = checked_bounds(&range)?;
        if end > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                ntuple_err!(
                    "unexpected eof reading {}..{} of {} bytes",
                    range.start,
                    range.end,
                    self.len()
                ),
            ));
        }
        Ok(self.slice(start..end))
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for File {
    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let (start, end) = checked_bounds(&range)?;
        let mut buffer = BytesMut::zeroed(end - start);
        read_exact_at(self, &mut buffer, range.start)?;
        Ok(buffer.freeze())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

fn checked_bounds(range: &Range<u64>) -> io::Result<(usize, usize)> {
    if range.end < range.start {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            ntuple_err!("inverted byte range {}..{}", range.start, range.end),
        ));
    }
    let start = usize::try_from(range.start).map_err(io::Error::other)?;
    let end = usize::try_from(range.end).map_err(io::Error::other)?;
    Ok((start, end))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buffer, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buffer: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buffer.is_empty() {
        match file.seek_read(buffer, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                let rest = buffer;
                buffer = &mut rest[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn bytes_read_and_eof() {
        let reader = Bytes::from_static(b"0123456789");
        assert_eq!(reader.read_byte_range(2..5).unwrap().as_ref(), b"234");
        assert_eq!(reader.size().unwrap(), 10);
        assert_eq!(
            reader.read_byte_range(8..11).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        #[allow(clippy::reversed_empty_ranges)]
        let inverted = reader.read_byte_range(5..2).unwrap_err();
        assert_eq!(inverted.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn file_positioned_reads() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello ntuple world").unwrap();
        file.flush().unwrap();

        assert_eq!(file.size().unwrap(), 18);
        assert_eq!(file.read_byte_range(6..12).unwrap().as_ref(), b"ntuple");

        let ranges = file.read_byte_ranges(&[0..5, 13..18]).unwrap();
        assert_eq!(ranges, vec![Bytes::from("hello"), Bytes::from("world")]);
        assert_eq!(
            file.read_byte_range(13..30).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn arc_dyn_reader() {
        let reader: Arc<dyn ReadAt> = Arc::new(Bytes::from_static(b"abc"));
        assert_eq!(reader.read_byte_range(1..3).unwrap().as_ref(), b"bc");
        assert_eq!(reader.performance_hint(), PerformanceHint::default());
    }
}
