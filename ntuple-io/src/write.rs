use std::fs::File;
use std::io;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// A sink for appending bytes to a backing store.
pub trait NTupleWrite: Send {
    fn write_all(&mut self, buffer: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Make everything written so far durable. After a successful shutdown a reader opened on
    /// the same storage observes all written bytes.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl NTupleWrite for Vec<u8> {
    fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
        self.extend_from_slice(buffer);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl NTupleWrite for File {
    fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
        Write::write_all(self, buffer)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Write::flush(self)?;
        self.sync_all()
    }
}

impl<W: NTupleWrite + ?Sized> NTupleWrite for &mut W {
    fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
        (**self).write_all(buffer)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }
}

/// An in-memory buffer that can be written by a sink and read back while the sink is alive.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the bytes written so far.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NTupleWrite for SharedBuffer {
    fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
        self.inner.lock().extend_from_slice(buffer);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wraps a writer and tracks the number of bytes written through it.
pub struct CountingWrite<W> {
    inner: W,
    position: u64,
}

impl<W: NTupleWrite> CountingWrite<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// The offset at which the next write will land.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn inner(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: NTupleWrite> NTupleWrite for CountingWrite<W> {
    fn write_all(&mut self, buffer: &[u8]) -> io::Result<()> {
        self.inner.write_all(buffer)?;
        self.position += buffer.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReadAt;

    #[test]
    fn counting_tracks_position() {
        let mut write = CountingWrite::new(Vec::new());
        write.write_all(b"abc").unwrap();
        write.write_all(b"").unwrap();
        write.write_all(b"de").unwrap();
        assert_eq!(write.position(), 5);
        assert_eq!(write.into_inner(), b"abcde".to_vec());
    }

    #[test]
    fn shared_buffer_is_readable_while_writing() {
        let buffer = SharedBuffer::new();
        let mut writer = buffer.clone();
        NTupleWrite::write_all(&mut writer, b"page").unwrap();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.to_bytes().read_byte_range(1..3).unwrap().as_ref(), b"ag");
    }

    #[test]
    fn file_shutdown_is_durable() {
        let mut file = tempfile::tempfile().unwrap();
        NTupleWrite::write_all(&mut file, b"footer").unwrap();
        NTupleWrite::shutdown(&mut file).unwrap();
        assert_eq!(file.read_byte_range(0..6).unwrap().as_ref(), b"footer");
    }
}
