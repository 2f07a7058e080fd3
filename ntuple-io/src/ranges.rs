use std::io;
use std::ops::Range;

use bytes::Bytes;
use log::trace;

use crate::ReadAt;

/// The outcome of a coalesced multi-range read.
#[derive(Debug)]
pub struct CoalescedRead {
    /// One buffer per requested range, in request order.
    pub buffers: Vec<Bytes>,
    /// Number of physical requests issued to the reader.
    pub n_requests: usize,
    /// Total number of bytes transferred, including gaps between merged ranges.
    pub bytes_read: u64,
}

/// Read `ranges` from `read`, merging ranges whose gap is at most `max_gap` into one request.
///
/// All merged requests are handed to the reader in a single [`ReadAt::read_byte_ranges`] call.
pub fn read_ranges<R: ReadAt + ?Sized>(
    read: &R,
    ranges: &[Range<u64>],
    max_gap: u64,
) -> io::Result<CoalescedRead> {
    let merged_ranges = merge_ranges(ranges.to_vec(), max_gap);
    let read_buffers = if merged_ranges.is_empty() {
        Vec::new()
    } else {
        read.read_byte_ranges(&merged_ranges)?
    };
    trace!(
        "coalesced {} ranges into {} requests",
        ranges.len(),
        merged_ranges.len()
    );

    let mut buffers = Vec::with_capacity(ranges.len());
    for range in ranges {
        let read_idx = merged_ranges
            .partition_point(|mr| mr.start <= range.start)
            .saturating_sub(1);
        let read_range_start = merged_ranges[read_idx].start;
        let read_bytes = &read_buffers[read_idx];
        let start = usize::try_from(range.start - read_range_start).map_err(io::Error::other)?;
        let end = usize::try_from(range.end - read_range_start).map_err(io::Error::other)?;
        if end > read_bytes.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        buffers.push(read_bytes.slice(start..end));
    }

    Ok(CoalescedRead {
        buffers,
        n_requests: merged_ranges.len(),
        bytes_read: merged_ranges.iter().map(|r| r.end - r.start).sum(),
    })
}

/// Sort `ranges` and merge neighbours that overlap or are separated by at most `max_gap` bytes.
pub fn merge_ranges(mut ranges: Vec<Range<u64>>, max_gap: u64) -> Vec<Range<u64>> {
    if ranges.is_empty() {
        return Vec::new();
    }

    ranges.sort_unstable_by_key(|r| r.start);
    let mut merged_ranges = Vec::with_capacity(ranges.len());

    let mut start_idx = 0;
    let mut end_idx = 1;

    while start_idx < ranges.len() {
        let mut range_end = ranges[start_idx].end;

        while end_idx < ranges.len()
            && ranges[end_idx]
                .start
                .checked_sub(range_end)
                .is_none_or(|gap| gap <= max_gap)
        {
            range_end = range_end.max(ranges[end_idx].end);
            end_idx += 1;
        }

        merged_ranges.push(ranges[start_idx].start..range_end);
        start_idx = end_idx;
        end_idx += 1;
    }

    merged_ranges
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(vec![0..2, 12..20], 10, vec![0..20])]
    #[case(vec![0..2, 12..20], 5, vec![0..2, 12..20])]
    #[case(vec![12..20, 0..2], 10, vec![0..20])]
    #[case(vec![0..10, 5..8, 9..12], 0, vec![0..12])]
    #[case(vec![], 10, vec![])]
    fn merges_ranges(
        #[case] ranges: Vec<Range<u64>>,
        #[case] max_gap: u64,
        #[case] expected: Vec<Range<u64>>,
    ) {
        assert_eq!(merge_ranges(ranges, max_gap), expected);
    }

    struct CountingRead {
        inner: Bytes,
        calls: AtomicUsize,
    }

    impl ReadAt for CountingRead {
        fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.read_byte_range(range)
        }

        fn size(&self) -> io::Result<u64> {
            self.inner.size()
        }
    }

    #[test]
    fn read_ranges_slices_in_request_order() {
        let read = CountingRead {
            inner: Bytes::from("trytoreadthisinmultiplechunks"),
            calls: AtomicUsize::new(0),
        };
        let result = read_ranges(&read, &[23..29, 5..9], 15).unwrap();
        assert_eq!(
            result.buffers,
            vec![Bytes::from("chunks"), Bytes::from("read")]
        );
        assert_eq!(result.n_requests, 1);
        assert_eq!(result.bytes_read, 24);
        assert_eq!(read.calls.load(Ordering::SeqCst), 1);

        let result = read_ranges(&read, &[23..29, 5..9], 2).unwrap();
        assert_eq!(result.n_requests, 2);
        assert_eq!(result.bytes_read, 10);
        assert_eq!(read.calls.load(Ordering::SeqCst), 3);
    }
}
