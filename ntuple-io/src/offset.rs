use std::io;
use std::ops::Range;

use bytes::Bytes;

use crate::{PerformanceHint, ReadAt};

/// An adapter that offsets all reads by a fixed amount.
///
/// Used to address a container embedded at a non-zero position of a larger resource.
#[derive(Debug, Clone)]
pub struct OffsetReadAt<R> {
    read: R,
    offset: u64,
}

impl<R: ReadAt> OffsetReadAt<R> {
    pub fn new(read: R, offset: u64) -> Self {
        Self { read, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<R: ReadAt> ReadAt for OffsetReadAt<R> {
    fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        self.read
            .read_byte_range(range.start + self.offset..range.end + self.offset)
    }

    fn read_byte_ranges(&self, ranges: &[Range<u64>]) -> io::Result<Vec<Bytes>> {
        let shifted = ranges
            .iter()
            .map(|r| r.start + self.offset..r.end + self.offset)
            .collect::<Vec<_>>();
        self.read.read_byte_ranges(&shifted)
    }

    fn performance_hint(&self) -> PerformanceHint {
        self.read.performance_hint()
    }

    fn size(&self) -> io::Result<u64> {
        self.read
            .size()
            .map(|len| len.saturating_sub(self.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_reads_and_size() {
        let read = OffsetReadAt::new(Bytes::from_static(b"xxxxheader"), 4);
        assert_eq!(read.size().unwrap(), 6);
        assert_eq!(read.read_byte_range(0..3).unwrap().as_ref(), b"hea");
        assert_eq!(
            read.read_byte_ranges(&[0..1, 5..6]).unwrap(),
            vec![Bytes::from("h"), Bytes::from("r")]
        );
    }
}
