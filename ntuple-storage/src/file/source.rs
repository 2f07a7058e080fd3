use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;
use log::debug;
use ntuple_descriptor::{Locator, N_BYTES_POSTSCRIPT, NTupleDescriptor, NTupleDescriptorBuilder};
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};
use ntuple_io::{CoalescedRead, OffsetReadAt, ReadAt, read_ranges};
use rustc_hash::FxHashMap;

use crate::SourceBackend;

/// Reads an ntuple from a container written by [`FileSinkBackend`](crate::FileSinkBackend).
///
/// Pages whose locator names a url are read from the external resource registered under that
/// url.
pub struct FileSourceBackend<R> {
    read: Arc<R>,
    externals: FxHashMap<String, Arc<dyn ReadAt>>,
}

impl FileSourceBackend<File> {
    pub fn open(path: impl AsRef<Path>) -> NTupleResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| ntuple_err!("cannot open {}: {err}", path.display()))?;
        Ok(Self::new(file))
    }

    /// Open a container that starts `offset` bytes into the file and extends to its end.
    pub fn open_at(path: impl AsRef<Path>, offset: u64) -> NTupleResult<FileSourceBackend<OffsetReadAt<File>>> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| ntuple_err!("cannot open {}: {err}", path.display()))?;
        let size = file.size()?;
        if offset > size {
            ntuple_bail!(InvalidArgument: "offset {offset} is past the end of {} ({size} bytes)", path.display());
        }
        Ok(FileSourceBackend::new(OffsetReadAt::new(file, offset)))
    }
}

impl<R: ReadAt + 'static> FileSourceBackend<R> {
    pub fn new(read: R) -> Self {
        Self {
            read: Arc::new(read),
            externals: FxHashMap::default(),
        }
    }

    /// Resolve locators with the given url against `read`.
    pub fn with_external(mut self, url: impl Into<String>, read: Arc<dyn ReadAt>) -> Self {
        self.externals.insert(url.into(), read);
        self
    }

    fn resolve(&self, url: &str) -> NTupleResult<&dyn ReadAt> {
        if url.is_empty() {
            return Ok(self.read.as_ref());
        }
        self.externals
            .get(url)
            .map(|read| read.as_ref())
            .ok_or_else(|| ntuple_err!("no resource is registered for url '{url}'"))
    }
}

impl<R: ReadAt + 'static> SourceBackend for FileSourceBackend<R> {
    fn attach(&self) -> NTupleResult<NTupleDescriptor> {
        let size = self.read.size()?;
        let postscript_size = N_BYTES_POSTSCRIPT as u64;
        if size < postscript_size {
            ntuple_bail!(Format: "container of {size} bytes is too small to hold a postscript");
        }
        let postscript = self.read.read_byte_range(size - postscript_size..size)?;
        let (header_size, footer_size) = NTupleDescriptor::locate_metadata(&postscript)?;

        let header_end = u64::from(header_size);
        let Some(footer_start) = size.checked_sub(u64::from(footer_size)) else {
            ntuple_bail!(Format: "footer of {footer_size} bytes does not fit a container of {size} bytes");
        };
        if header_end > footer_start {
            ntuple_bail!(
                Format: "header of {header_size} bytes overlaps the footer starting at {footer_start}"
            );
        }

        let metadata = self
            .read
            .read_byte_ranges(&[0..header_end, footer_start..size])?;
        let [header, footer] = metadata.as_slice() else {
            ntuple_bail!("expected the header and the footer, read {} buffers", metadata.len());
        };
        let mut builder = NTupleDescriptorBuilder::new();
        builder.set_from_header(header)?;
        builder.add_clusters_from_footer(footer)?;
        builder.ensure_valid()?;
        debug!("read header of {header_size} bytes and footer of {footer_size} bytes");
        Ok(builder.move_descriptor())
    }

    fn load_page(&self, locator: &Locator) -> NTupleResult<Bytes> {
        Ok(self
            .resolve(locator.url())?
            .read_byte_range(locator.byte_range()?)?)
    }

    fn load_pages(&self, locators: &[Locator]) -> NTupleResult<CoalescedRead> {
        let mut buffers = vec![Bytes::new(); locators.len()];
        let mut n_requests = 0;
        let mut bytes_read = 0;

        let by_url = locators
            .iter()
            .enumerate()
            .into_group_map_by(|&(_, locator)| locator.url());
        for (url, group) in by_url {
            let read = self.resolve(url)?;
            let ranges = group
                .iter()
                .map(|(_, locator)| locator.byte_range())
                .collect::<NTupleResult<Vec<_>>>()?;
            let max_gap = coalescing_gap(&ranges, read.performance_hint().coalescing_window());
            let result = read_ranges(read, &ranges, max_gap)?;
            for ((idx, _), bytes) in group.iter().zip(result.buffers) {
                buffers[*idx] = bytes;
            }
            n_requests += result.n_requests;
            bytes_read += result.bytes_read;
        }

        Ok(CoalescedRead {
            buffers,
            n_requests,
            bytes_read,
        })
    }

    fn try_clone(&self) -> NTupleResult<Self> {
        Ok(Self {
            read: Arc::clone(&self.read),
            externals: self.externals.clone(),
        })
    }
}

/// The largest gap between neighbouring ranges worth reading through.
///
/// Gaps are admitted from the smallest up for as long as the bytes read in addition to the
/// payload stay within a quarter of it. No gap is larger than `window`.
pub(crate) fn coalescing_gap(ranges: &[Range<u64>], window: u64) -> u64 {
    if window == 0 {
        return 0;
    }
    let payload: u64 = ranges.iter().map(|r| r.end - r.start).sum();
    let budget = payload / 4;

    let gaps = ranges
        .iter()
        .sorted_by_key(|r| r.start)
        .tuple_windows()
        .filter_map(|(a, b)| b.start.checked_sub(a.end))
        .sorted()
        .collect::<Vec<_>>();

    let mut max_gap = 0;
    let mut overhead = 0;
    for (gap, equal) in &gaps.into_iter().chunk_by(|gap| *gap) {
        overhead += gap * equal.count() as u64;
        if gap > window || overhead > budget {
            break;
        }
        max_gap = gap;
    }
    max_gap
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ntuple_descriptor::{ColumnType, Field, NTupleModel};
    use rstest::rstest;

    use super::*;
    use crate::{CompressionSettings, FileSinkBackend, PageSink, WriteOptions};

    fn container() -> Vec<u8> {
        let model = NTupleModel::new().with_field(Field::leaf("x", "std::int32_t", ColumnType::Int32));
        let options = WriteOptions::default().with_compression(CompressionSettings::UNCOMPRESSED);
        let mut sink = PageSink::new("embedded", FileSinkBackend::new(Vec::new()), options);
        let handles = sink.create(&model).unwrap();
        let mut page = sink.reserve_page(&handles[0], 3).unwrap();
        page.extend_from_slice(&[7i32, 8, 9]).unwrap();
        sink.commit_page(&handles[0], &page).unwrap();
        sink.commit_cluster(3).unwrap();
        sink.commit_dataset().unwrap();
        sink.into_backend().into_inner()
    }

    #[rstest]
    // 300 bytes of payload admit 75 bytes of gaps
    #[case(vec![0..100, 110..210, 260..360, 460..460], 1 << 20, 50)]
    #[case(vec![0..100, 110..210, 260..360], 5, 0)]
    #[case(vec![0..100, 100..200], 1 << 20, 0)]
    #[case(vec![0..100, 120..220, 240..340], 1 << 20, 20)]
    #[case(vec![0..100, 120..220], 0, 0)]
    fn gap_stays_within_budget(
        #[case] ranges: Vec<Range<u64>>,
        #[case] window: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(coalescing_gap(&ranges, window), expected);
    }

    #[test]
    fn too_small_container() {
        let source = FileSourceBackend::new(Bytes::from_static(&[0; 8]));
        assert!(source.attach().unwrap_err().is_format());
    }

    #[test]
    fn container_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedded.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"leading bytes of another format").unwrap();
        file.write_all(&container()).unwrap();
        drop(file);

        let source = FileSourceBackend::open_at(&path, 31).unwrap();
        let desc = source.attach().unwrap();
        assert_eq!(desc.name(), "embedded");
        assert_eq!(desc.n_entries(), 3);
        let x = desc.find_column_id(desc.find_field_id("x").unwrap(), 0).unwrap();
        let locator = &desc.cluster_descriptor(0).unwrap().page_range(x).unwrap().page_infos()[0].locator;
        assert_eq!(source.load_page(locator).unwrap().as_ref(), &[7, 0, 0, 0, 8, 0, 0, 0, 9, 0, 0, 0]);

        assert!(FileSourceBackend::open(&path).unwrap().attach().is_err());
        assert!(FileSourceBackend::open_at(&path, 1 << 20).is_err());
    }

    #[test]
    fn header_size_must_match_header_frame() {
        let container = container();
        let postscript = container.len() - N_BYTES_POSTSCRIPT;
        let (header_size, _) = NTupleDescriptor::locate_metadata(&container[postscript..]).unwrap();
        let header_size = header_size as usize;

        // four bytes of padding after the header, covered by the recorded header size
        let mut padded = container[..header_size].to_vec();
        padded.extend_from_slice(&[0; 4]);
        padded.extend_from_slice(&container[header_size..]);
        let size_at = padded.len() - N_BYTES_POSTSCRIPT + 8;
        let recorded = u32::try_from(header_size + 4).unwrap();
        padded[size_at..size_at + 4].copy_from_slice(&recorded.to_le_bytes());

        let source = FileSourceBackend::new(Bytes::from(padded));
        assert!(source.attach().unwrap_err().is_format());
        assert!(FileSourceBackend::new(Bytes::from(container)).attach().is_ok());
    }

    #[test]
    fn external_pages() {
        let source = FileSourceBackend::new(Bytes::from_static(b"local"))
            .with_external("remote", Arc::new(Bytes::from_static(b"far away")));
        let local = source.load_page(&Locator::new(0, 5)).unwrap();
        assert_eq!(local.as_ref(), b"local");

        let read = source
            .load_pages(&[
                Locator::new(4, 4).with_url("remote"),
                Locator::new(1, 2),
                Locator::new(0, 3).with_url("remote"),
            ])
            .unwrap();
        assert_eq!(
            read.buffers,
            vec![
                Bytes::from_static(b"away"),
                Bytes::from_static(b"oc"),
                Bytes::from_static(b"far"),
            ]
        );
        assert!(source.load_page(&Locator::new(0, 1).with_url("elsewhere")).is_err());
    }
}
