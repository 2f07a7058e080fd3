use std::collections::BTreeMap;

use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};

use crate::serialize::frame::{FrameReader, FrameWriter, N_BYTES_POSTSCRIPT};
use crate::{
    ClusterDescriptor, ColumnRange, DescriptorId, NTupleDescriptor, PageInfo, PageRange,
};

impl NTupleDescriptor {
    /// Serialize all clusters currently held, followed by the postscript.
    ///
    /// Returns the size of the footer including the postscript. Without a buffer only the size is
    /// computed.
    pub fn serialize_footer(&self, buffer: Option<&mut [u8]>) -> NTupleResult<usize> {
        let header_size = u32::try_from(self.serialize_header(None)?)
            .map_err(|_| ntuple_err!(Format: "header exceeds the 32bit size limit"))?;
        let size = write_footer(self, header_size, &mut FrameWriter::counting())?;
        if let Some(buffer) = buffer {
            write_footer(self, header_size, &mut FrameWriter::new(buffer))?;
        }
        Ok(size)
    }

    /// Serialize the footer into a freshly allocated buffer.
    pub fn footer_bytes(&self) -> NTupleResult<Vec<u8>> {
        let mut buffer = vec![0u8; self.serialize_footer(None)?];
        self.serialize_footer(Some(&mut buffer))?;
        Ok(buffer)
    }

    /// Extract `(header size, footer size)` from the postscript, i.e. the last
    /// [`N_BYTES_POSTSCRIPT`] bytes of a footer.
    pub fn locate_metadata(postscript: &[u8]) -> NTupleResult<(u32, u32)> {
        if postscript.len() != N_BYTES_POSTSCRIPT {
            ntuple_bail!(
                Format: "postscript must be exactly {N_BYTES_POSTSCRIPT} bytes, got {}",
                postscript.len()
            );
        }
        let frame = FrameReader::new(postscript, "postscript").frame("postscript")?;
        if frame.bytes.len() != N_BYTES_POSTSCRIPT {
            ntuple_bail!(
                Format: "postscript frame size {} does not match its length {N_BYTES_POSTSCRIPT}",
                frame.preamble.size
            );
        }
        let mut r = frame.reader();
        let header_size = r.read_u32()?;
        let footer_size = r.read_u32()?;
        r.finish()?;
        if (footer_size as usize) < N_BYTES_POSTSCRIPT {
            ntuple_bail!(Format: "postscript records a footer of {footer_size} bytes, smaller than the postscript itself");
        }
        Ok((header_size, footer_size))
    }
}

fn write_footer(
    desc: &NTupleDescriptor,
    header_size: u32,
    w: &mut FrameWriter<'_>,
) -> NTupleResult<usize> {
    let start = w.begin_frame()?;
    w.write_len(desc.clusters.len(), "cluster")?;
    for cluster in desc.clusters.values() {
        write_cluster(cluster, w)?;
    }
    w.end_frame_with_checksum(start, "footer")?;

    let footer_size = u32::try_from(w.position() - start + N_BYTES_POSTSCRIPT)
        .map_err(|_| ntuple_err!(Format: "footer exceeds the 32bit size limit"))?;
    let postscript = w.begin_frame()?;
    w.write_u32(header_size)?;
    w.write_u32(footer_size)?;
    w.end_frame(postscript, "postscript")?;
    Ok(w.position() - start)
}

fn write_cluster(cluster: &ClusterDescriptor, w: &mut FrameWriter<'_>) -> NTupleResult<()> {
    let start = w.begin_frame()?;
    w.write_u64(cluster.id)?;
    w.write_version(cluster.version)?;
    w.write_u64(cluster.first_entry_index)?;
    w.write_u32(cluster.n_entries)?;
    w.write_locator(&cluster.locator)?;

    w.write_len(cluster.column_ranges.len(), "column range")?;
    for range in cluster.column_ranges.values() {
        let range_start = w.begin_frame()?;
        w.write_u64(range.column_id)?;
        w.write_u64(range.first_element_index)?;
        w.write_u32(range.n_elements)?;
        w.write_i64(range.compression_settings)?;
        w.end_frame(range_start, "column range")?;
    }

    w.write_len(cluster.page_ranges.len(), "page range")?;
    for range in cluster.page_ranges.values() {
        let range_start = w.begin_frame()?;
        w.write_u64(range.column_id)?;
        w.write_len(range.n_pages(), "page")?;
        for page in range.page_infos() {
            w.write_u32(page.n_elements)?;
            w.write_locator(&page.locator)?;
        }
        w.end_frame(range_start, "page range")?;
    }
    w.end_frame(start, "cluster")
}

/// Decode a footer (including its postscript) into cluster descriptors, without checking them
/// against any schema.
pub(crate) fn read_footer(bytes: &[u8]) -> NTupleResult<Vec<ClusterDescriptor>> {
    let mut outer = FrameReader::new(bytes, "footer");
    let frame = outer.frame("footer")?;
    let mut r = frame.verify_checksum()?;
    let n_clusters = r.read_len()?;
    let clusters = (0..n_clusters)
        .map(|_| read_cluster(&mut r))
        .collect::<NTupleResult<Vec<_>>>()?;
    r.finish()?;

    let footer_frame_size = outer.position();
    let Some(postscript) = bytes.get(footer_frame_size..footer_frame_size + N_BYTES_POSTSCRIPT)
    else {
        ntuple_bail!(
            Format: "footer truncated: no postscript after the {footer_frame_size} byte footer frame"
        );
    };
    let (_, footer_size) = NTupleDescriptor::locate_metadata(postscript)?;
    if footer_size as usize != footer_frame_size + N_BYTES_POSTSCRIPT {
        ntuple_bail!(
            Format: "postscript records a footer of {footer_size} bytes, found {}",
            footer_frame_size + N_BYTES_POSTSCRIPT
        );
    }
    Ok(clusters)
}

fn read_cluster(parent: &mut FrameReader<'_>) -> NTupleResult<ClusterDescriptor> {
    let frame = parent.frame("cluster")?;
    let mut r = frame.reader();
    let id = r.read_u64()?;
    let cluster =
        read_cluster_body(&mut r, id).map_err(|e| e.with_context(format!("cluster {id}")))?;
    r.finish()?;
    Ok(cluster)
}

fn read_cluster_body(r: &mut FrameReader<'_>, id: DescriptorId) -> NTupleResult<ClusterDescriptor> {
    let version = r.read_version()?;
    let first_entry_index = r.read_u64()?;
    let n_entries = r.read_u32()?;
    let mut cluster = ClusterDescriptor::new(id, version, first_entry_index, n_entries);
    cluster.locator = r.read_locator()?;

    let n_column_ranges = r.read_len()?;
    let mut column_ranges = BTreeMap::new();
    for _ in 0..n_column_ranges {
        let frame = r.frame("column range")?;
        let mut cr = frame.reader();
        let range = ColumnRange {
            column_id: cr.read_u64()?,
            first_element_index: cr.read_u64()?,
            n_elements: cr.read_u32()?,
            compression_settings: cr.read_i64()?,
        };
        cr.finish()?;
        if let Some(previous) = column_ranges.insert(range.column_id, range) {
            ntuple_bail!(Format: "duplicate column range for column {}", previous.column_id);
        }
    }

    let n_page_ranges = r.read_len()?;
    let mut page_ranges = BTreeMap::new();
    for _ in 0..n_page_ranges {
        let frame = r.frame("page range")?;
        let mut pr = frame.reader();
        let column_id = pr.read_u64()?;
        let n_pages = pr.read_len()?;
        let page_infos = (0..n_pages)
            .map(|_| {
                let n_elements = pr.read_u32()?;
                let locator = pr.read_locator()?;
                Ok(PageInfo::new(n_elements, locator))
            })
            .collect::<NTupleResult<Vec<_>>>()?;
        pr.finish()?;
        if page_ranges
            .insert(column_id, PageRange::from_pages(column_id, page_infos))
            .is_some()
        {
            ntuple_bail!(Format: "duplicate page range for column {column_id}");
        }
    }

    cluster.column_ranges = column_ranges;
    cluster.page_ranges = page_ranges;
    Ok(cluster)
}
