use log::trace;
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};
use uuid::Uuid;

use crate::{Locator, NTupleVersion};

/// The version written into every frame.
pub const FRAME_VERSION_CURRENT: u16 = 0;
/// The oldest frame version this reader understands.
pub const FRAME_VERSION_MIN: u16 = 0;

/// Size of the `(version current, version min, frame size)` prefix of every frame.
pub const N_BYTES_PREAMBLE: usize = 8;
/// Size of the postscript frame that terminates a footer.
pub const N_BYTES_POSTSCRIPT: usize = 16;

pub(crate) const N_BYTES_CHECKSUM: usize = 4;

/// Writes little-endian values, either into a buffer or only counting their size.
///
/// Both passes of a two-pass serialization run the exact same code, so the size reported by the
/// counting pass is the number of bytes written by the filling pass.
pub(crate) struct FrameWriter<'a> {
    buffer: Option<&'a mut [u8]>,
    pos: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn counting() -> Self {
        Self {
            buffer: None,
            pos: 0,
        }
    }

    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer: Some(buffer),
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> NTupleResult<()> {
        let end = self.pos + bytes.len();
        if let Some(buffer) = self.buffer.as_deref_mut() {
            let len = buffer.len();
            let Some(dst) = buffer.get_mut(self.pos..end) else {
                ntuple_bail!("serialization buffer of {len} bytes is too small, need at least {end}");
            };
            dst.copy_from_slice(bytes);
        }
        self.pos = end;
        Ok(())
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) {
        if let Some(dst) = self
            .buffer
            .as_deref_mut()
            .and_then(|b| b.get_mut(at..at + bytes.len()))
        {
            dst.copy_from_slice(bytes);
        }
    }

    pub fn write_u8(&mut self, value: u8) -> NTupleResult<()> {
        self.put(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> NTupleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> NTupleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> NTupleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> NTupleResult<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_len(&mut self, len: usize, what: &str) -> NTupleResult<()> {
        let len = u32::try_from(len)
            .map_err(|_| ntuple_err!(Format: "{what} count {len} exceeds the 32bit limit"))?;
        self.write_u32(len)
    }

    pub fn write_string(&mut self, value: &str) -> NTupleResult<()> {
        self.write_len(value.len(), "string byte")?;
        self.put(value.as_bytes())
    }

    pub fn write_uuid(&mut self, value: &Uuid) -> NTupleResult<()> {
        self.put(value.as_bytes())
    }

    pub fn write_version(&mut self, value: NTupleVersion) -> NTupleResult<()> {
        self.write_u32(value.version_use())?;
        self.write_u32(value.version_min())?;
        self.write_u64(value.flags())
    }

    pub fn write_locator(&mut self, value: &Locator) -> NTupleResult<()> {
        self.write_i64(value.position())?;
        self.write_u32(value.bytes_on_storage())?;
        self.write_string(value.url())
    }

    /// Write a preamble with a placeholder size and return the frame's start offset.
    pub fn begin_frame(&mut self) -> NTupleResult<usize> {
        let start = self.pos;
        self.write_u16(FRAME_VERSION_CURRENT)?;
        self.write_u16(FRAME_VERSION_MIN)?;
        self.write_u32(0)?;
        Ok(start)
    }

    /// Patch the size of the frame that started at `start`.
    pub fn end_frame(&mut self, start: usize, kind: &str) -> NTupleResult<()> {
        let size = frame_size(self.pos - start, kind)?;
        self.patch(start + 4, &size.to_le_bytes());
        Ok(())
    }

    /// Patch the size of the frame that started at `start` and terminate it with a CRC-32 of
    /// everything written since.
    pub fn end_frame_with_checksum(&mut self, start: usize, kind: &str) -> NTupleResult<()> {
        let size = frame_size(self.pos - start + N_BYTES_CHECKSUM, kind)?;
        self.patch(start + 4, &size.to_le_bytes());
        let crc = self
            .buffer
            .as_deref()
            .and_then(|b| b.get(start..self.pos))
            .map(crc32fast::hash)
            .unwrap_or_default();
        self.write_u32(crc)
    }
}

fn frame_size(size: usize, kind: &str) -> NTupleResult<u32> {
    u32::try_from(size).map_err(|_| ntuple_err!(Format: "{kind} frame of {size} bytes exceeds the 32bit limit"))
}

/// The fixed prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Preamble {
    pub version_current: u16,
    pub version_min: u16,
    pub size: u32,
}

/// A complete frame, validated for version compatibility and length.
pub(crate) struct Frame<'a> {
    pub preamble: Preamble,
    /// All bytes of the frame, including its preamble.
    pub bytes: &'a [u8],
    kind: &'static str,
}

impl<'a> Frame<'a> {
    /// A reader over the frame's payload.
    pub fn reader(&self) -> FrameReader<'a> {
        FrameReader::framed(&self.bytes[N_BYTES_PREAMBLE..], self.kind, self.preamble)
    }

    /// Verify the trailing CRC-32 and return a reader over the payload without it.
    pub fn verify_checksum(&self) -> NTupleResult<FrameReader<'a>> {
        let kind = self.kind;
        let Some(split) = self.bytes.len().checked_sub(N_BYTES_CHECKSUM) else {
            ntuple_bail!(Format: "{kind} frame too small to hold a checksum");
        };
        if split < N_BYTES_PREAMBLE {
            ntuple_bail!(Format: "{kind} frame too small to hold a checksum");
        }
        let (payload, stored) = self.bytes.split_at(split);
        let mut stored_crc = [0u8; N_BYTES_CHECKSUM];
        stored_crc.copy_from_slice(stored);
        let stored_crc = u32::from_le_bytes(stored_crc);
        let computed_crc = crc32fast::hash(payload);
        if stored_crc != computed_crc {
            ntuple_bail!(
                Format: "{kind} frame checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            );
        }
        Ok(FrameReader::framed(
            &payload[N_BYTES_PREAMBLE..],
            kind,
            self.preamble,
        ))
    }
}

/// Reads little-endian values from a frame's payload, failing with a format error that names
/// the frame on truncation.
pub(crate) struct FrameReader<'a> {
    buffer: &'a [u8],
    pos: usize,
    kind: &'static str,
    preamble: Option<Preamble>,
}

impl<'a> FrameReader<'a> {
    pub fn new(buffer: &'a [u8], kind: &'static str) -> Self {
        Self {
            buffer,
            pos: 0,
            kind,
            preamble: None,
        }
    }

    fn framed(buffer: &'a [u8], kind: &'static str, preamble: Preamble) -> Self {
        Self {
            buffer,
            pos: 0,
            kind,
            preamble: Some(preamble),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> NTupleResult<&'a [u8]> {
        let kind = self.kind;
        let bytes = self
            .pos
            .checked_add(n)
            .and_then(|end| self.buffer.get(self.pos..end))
            .ok_or_else(|| {
                ntuple_err!(
                    Format: "{kind} frame truncated: need {n} bytes at offset {}, {} available",
                    self.pos,
                    self.buffer.len().saturating_sub(self.pos)
                )
            })?;
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> NTupleResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> NTupleResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> NTupleResult<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> NTupleResult<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> NTupleResult<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> NTupleResult<i64> {
        self.take_array().map(i64::from_le_bytes)
    }

    pub fn read_len(&mut self) -> NTupleResult<usize> {
        Ok(usize::try_from(self.read_u32()?)?)
    }

    pub fn read_string(&mut self) -> NTupleResult<String> {
        let len = self.read_len()?;
        let kind = self.kind;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|e| ntuple_err!(Format: "{kind} frame holds an invalid utf-8 string: {e}"))
    }

    pub fn read_uuid(&mut self) -> NTupleResult<Uuid> {
        self.take_array().map(Uuid::from_bytes)
    }

    pub fn read_version(&mut self) -> NTupleResult<NTupleVersion> {
        Ok(NTupleVersion::new(
            self.read_u32()?,
            self.read_u32()?,
            self.read_u64()?,
        ))
    }

    pub fn read_locator(&mut self) -> NTupleResult<Locator> {
        let position = self.read_i64()?;
        let bytes_on_storage = self.read_u32()?;
        let url = self.read_string()?;
        Ok(Locator::new(position, bytes_on_storage).with_url(url))
    }

    /// Read the next frame, checking that this reader is able to interpret it.
    pub fn frame(&mut self, kind: &'static str) -> NTupleResult<Frame<'a>> {
        let start = self.pos;
        let mut preamble_reader = FrameReader::new(self.take(N_BYTES_PREAMBLE)?, kind);
        let preamble = Preamble {
            version_current: preamble_reader.read_u16()?,
            version_min: preamble_reader.read_u16()?,
            size: preamble_reader.read_u32()?,
        };
        check_preamble(&preamble, kind)?;

        let size = usize::try_from(preamble.size)?;
        let Some(bytes) = self.buffer.get(start..start + size) else {
            ntuple_bail!(
                Format: "{kind} frame truncated: frame size is {size} bytes, {} available",
                self.buffer.len() - start
            );
        };
        self.pos = start + size;
        Ok(Frame {
            preamble,
            bytes,
            kind,
        })
    }

    /// Check that the payload was consumed. Frames written by a newer writer may carry trailing
    /// data that this reader does not know about; it is skipped.
    pub fn finish(self) -> NTupleResult<()> {
        let remaining = self.buffer.len() - self.pos.min(self.buffer.len());
        if remaining == 0 {
            return Ok(());
        }
        match self.preamble {
            Some(preamble) if preamble.version_current > FRAME_VERSION_CURRENT => {
                trace!(
                    "skipping {remaining} trailing bytes of {} frame version {}",
                    self.kind, preamble.version_current
                );
                Ok(())
            }
            _ => Err(ntuple_err!(
                Format: "{} frame has {remaining} unexpected trailing bytes",
                self.kind
            )),
        }
    }
}

fn check_preamble(preamble: &Preamble, kind: &str) -> NTupleResult<()> {
    if preamble.version_min > FRAME_VERSION_CURRENT {
        ntuple_bail!(
            Format: "{kind} frame requires reader version {}, this reader implements version {FRAME_VERSION_CURRENT}",
            preamble.version_min
        );
    }
    if !(FRAME_VERSION_MIN..).contains(&preamble.version_current) {
        ntuple_bail!(
            Format: "{kind} frame version {} is older than the oldest supported version {FRAME_VERSION_MIN}",
            preamble.version_current
        );
    }
    if preamble.version_min > preamble.version_current {
        ntuple_bail!(
            Format: "{kind} frame minimum version {} exceeds its version {}",
            preamble.version_min,
            preamble.version_current
        );
    }
    if (preamble.size as usize) < N_BYTES_PREAMBLE {
        ntuple_bail!(Format: "{kind} frame size {} is smaller than its preamble", preamble.size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed_u32(value: u32) -> Vec<u8> {
        let mut counting = FrameWriter::counting();
        let start = counting.begin_frame().unwrap();
        counting.write_u32(value).unwrap();
        counting.end_frame(start, "test").unwrap();

        let mut buffer = vec![0u8; counting.position()];
        let mut writer = FrameWriter::new(&mut buffer);
        let start = writer.begin_frame().unwrap();
        writer.write_u32(value).unwrap();
        writer.end_frame(start, "test").unwrap();
        buffer
    }

    #[test]
    fn preamble_layout() {
        let buffer = framed_u32(7);
        assert_eq!(buffer.len(), 12);
        assert_eq!(&buffer[..8], &[0, 0, 0, 0, 12, 0, 0, 0]);

        let frame = FrameReader::new(&buffer, "test").frame("test").unwrap();
        assert_eq!(frame.preamble.size, 12);
        let mut reader = frame.reader();
        assert_eq!(reader.read_u32().unwrap(), 7);
        reader.finish().unwrap();
    }

    #[test]
    fn rejects_frames_requiring_newer_reader() {
        let mut buffer = framed_u32(7);
        buffer[0] = 2;
        buffer[2] = 1;
        let err = FrameReader::new(&buffer, "test").frame("test").err().unwrap();
        assert!(err.is_format());
        assert!(err.to_string().contains("requires reader version 1"));
    }

    #[test]
    fn skips_trailing_bytes_of_newer_frames() {
        let mut buffer = framed_u32(7);
        buffer.extend_from_slice(&[0xAA, 0xBB]);
        buffer[0] = 1;
        buffer[4] = 14;
        let frame = FrameReader::new(&buffer, "test").frame("test").unwrap();
        let mut reader = frame.reader();
        assert_eq!(reader.read_u32().unwrap(), 7);
        reader.finish().unwrap();

        // the same trailing bytes in a frame of the current version are a corruption
        buffer[0] = 0;
        let frame = FrameReader::new(&buffer, "test").frame("test").unwrap();
        let mut reader = frame.reader();
        reader.read_u32().unwrap();
        assert!(reader.finish().unwrap_err().is_format());
    }

    #[test]
    fn truncation_is_a_format_error() {
        let buffer = framed_u32(7);
        let err = FrameReader::new(&buffer[..10], "header").frame("header").err().unwrap();
        assert!(err.is_format());
        assert!(err.to_string().contains("header frame truncated"));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut counting = FrameWriter::counting();
        let start = counting.begin_frame().unwrap();
        counting.write_string("payload").unwrap();
        counting.end_frame_with_checksum(start, "footer").unwrap();

        let mut buffer = vec![0u8; counting.position()];
        let mut writer = FrameWriter::new(&mut buffer);
        let start = writer.begin_frame().unwrap();
        writer.write_string("payload").unwrap();
        writer.end_frame_with_checksum(start, "footer").unwrap();

        let frame = FrameReader::new(&buffer, "footer").frame("footer").unwrap();
        let mut reader = frame.verify_checksum().unwrap();
        assert_eq!(reader.read_string().unwrap(), "payload");
        reader.finish().unwrap();

        buffer[10] ^= 0xFF;
        let frame = FrameReader::new(&buffer, "footer").frame("footer").unwrap();
        let err = frame.verify_checksum().err().unwrap();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn small_buffer_is_rejected() {
        let mut buffer = [0u8; 4];
        let mut writer = FrameWriter::new(&mut buffer);
        assert!(writer.write_u64(1).is_err());
    }
}
