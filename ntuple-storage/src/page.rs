use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use ntuple_descriptor::{ClusterIndex, ClusterSize, ColumnType, DescriptorId, NTupleSize};
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};

use crate::compress::compress;
use crate::{ColumnElement, CompressionSettings};

/// Locates a page within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClusterInfo {
    id: DescriptorId,
    /// Global index of the first element of the column in this cluster.
    index_offset: NTupleSize,
}

impl ClusterInfo {
    pub fn new(id: DescriptorId, index_offset: NTupleSize) -> Self {
        Self { id, index_offset }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn index_offset(&self) -> NTupleSize {
        self.index_offset
    }
}

/// A page being filled before it is committed to a [`PageSink`](crate::PageSink).
#[derive(Debug)]
pub struct PageMut {
    column_id: DescriptorId,
    column_type: ColumnType,
    capacity: usize,
    buffer: BytesMut,
}

impl PageMut {
    pub(crate) fn new(column_id: DescriptorId, column_type: ColumnType, capacity: usize) -> NTupleResult<Self> {
        if column_type.element_size() == 0 {
            ntuple_bail!("cannot reserve a page for column {column_id} of type {column_type}");
        }
        Ok(Self {
            column_id,
            column_type,
            capacity,
            buffer: BytesMut::with_capacity(capacity * column_type.element_size()),
        })
    }

    pub fn column_id(&self) -> DescriptorId {
        self.column_id
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_elements(&self) -> usize {
        self.buffer.len() / self.column_type.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.n_elements() >= self.capacity
    }

    /// The packed elements.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push<T: ColumnElement>(&mut self, value: T) -> NTupleResult<()> {
        self.extend_from_slice(&[value])
    }

    pub fn extend_from_slice<T: ColumnElement>(&mut self, values: &[T]) -> NTupleResult<()> {
        check_element_type::<T>(self.column_id, self.column_type)?;
        if self.n_elements() + values.len() > self.capacity {
            ntuple_bail!(
                "page of column {} holds {} of {} elements, cannot add {} more",
                self.column_id,
                self.n_elements(),
                self.capacity,
                values.len()
            );
        }
        let mut element = [0u8; 8];
        for value in values {
            value.write_le(&mut element[..T::SIZE]);
            self.buffer.put_slice(&element[..T::SIZE]);
        }
        Ok(())
    }

    /// Drop all elements, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// The bytes of a page as they go to storage: compressed, or packed if compression is off or
/// does not shrink them.
#[derive(Debug, Clone)]
pub struct SealedPage {
    column_id: DescriptorId,
    n_elements: ClusterSize,
    packed_size: usize,
    buffer: Bytes,
}

impl SealedPage {
    pub fn seal(
        column_id: DescriptorId,
        n_elements: ClusterSize,
        packed: Bytes,
        compression: CompressionSettings,
    ) -> NTupleResult<Self> {
        let packed_size = packed.len();
        let buffer = match compress(compression, &packed)? {
            Some(zipped) => Bytes::from(zipped),
            None => packed,
        };
        Ok(Self {
            column_id,
            n_elements,
            packed_size,
            buffer,
        })
    }

    pub fn column_id(&self) -> DescriptorId {
        self.column_id
    }

    pub fn n_elements(&self) -> ClusterSize {
        self.n_elements
    }

    /// Size of the elements before compression.
    pub fn packed_size(&self) -> usize {
        self.packed_size
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn is_compressed(&self) -> bool {
        self.buffer.len() != self.packed_size
    }
}

/// A populated, immutable page of a column, covering a window of consecutive elements within one
/// cluster.
///
/// Pages are cheap to clone. A page handed out by a [`PageSource`](crate::PageSource) must be
/// returned with [`release_page`](crate::PageStorage::release_page) once the caller is done.
#[derive(Debug, Clone)]
pub struct Page {
    column_id: DescriptorId,
    column_type: ColumnType,
    buffer: Bytes,
    n_elements: ClusterSize,
    global_first: NTupleSize,
    cluster_info: ClusterInfo,
}

impl Page {
    pub fn new(
        column_id: DescriptorId,
        column_type: ColumnType,
        buffer: Bytes,
        n_elements: ClusterSize,
        global_first: NTupleSize,
        cluster_info: ClusterInfo,
    ) -> NTupleResult<Self> {
        let expected = n_elements as usize * column_type.element_size();
        if buffer.len() != expected {
            ntuple_bail!(
                Format: "page of column {column_id} holds {} bytes, {n_elements} {column_type} elements need {expected}",
                buffer.len()
            );
        }
        if global_first < cluster_info.index_offset {
            ntuple_bail!(
                "page of column {column_id} starts at element {global_first} before its cluster {} at {}",
                cluster_info.id,
                cluster_info.index_offset
            );
        }
        Ok(Self {
            column_id,
            column_type,
            buffer,
            n_elements,
            global_first,
            cluster_info,
        })
    }

    pub fn column_id(&self) -> DescriptorId {
        self.column_id
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn n_elements(&self) -> ClusterSize {
        self.n_elements
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        self.cluster_info
    }

    /// Global element indexes covered by the page.
    pub fn global_range(&self) -> Range<NTupleSize> {
        self.global_first..self.global_first + NTupleSize::from(self.n_elements)
    }

    /// Cluster-relative element indexes covered by the page.
    pub fn cluster_range(&self) -> Range<NTupleSize> {
        let first = self.global_first - self.cluster_info.index_offset;
        first..first + NTupleSize::from(self.n_elements)
    }

    pub fn contains(&self, global_index: NTupleSize) -> bool {
        self.global_range().contains(&global_index)
    }

    pub fn contains_cluster_index(&self, index: ClusterIndex) -> bool {
        self.cluster_info.id == index.cluster_id()
            && self
                .cluster_range()
                .contains(&NTupleSize::from(index.index()))
    }

    /// The element at a global index.
    pub fn get<T: ColumnElement>(&self, global_index: NTupleSize) -> NTupleResult<T> {
        check_element_type::<T>(self.column_id, self.column_type)?;
        let range = self.global_range();
        if !range.contains(&global_index) {
            return Err(ntuple_err!(OutOfBounds: global_index, range.start, range.end));
        }
        let offset = usize::try_from(global_index - range.start)? * T::SIZE;
        Ok(T::read_le(&self.buffer[offset..offset + T::SIZE]))
    }

    /// The element at a cluster-relative index.
    pub fn get_in_cluster<T: ColumnElement>(&self, index: ClusterIndex) -> NTupleResult<T> {
        if index.cluster_id() != self.cluster_info.id {
            ntuple_bail!(
                "page of column {} belongs to cluster {}, not {}",
                self.column_id,
                self.cluster_info.id,
                index.cluster_id()
            );
        }
        self.get(self.cluster_info.index_offset + NTupleSize::from(index.index()))
    }

    /// All elements of the page.
    pub fn values<T: ColumnElement>(&self) -> NTupleResult<Vec<T>> {
        check_element_type::<T>(self.column_id, self.column_type)?;
        Ok(self.buffer.chunks_exact(T::SIZE).map(T::read_le).collect())
    }

    pub(crate) fn is_same_page(&self, other: &Page) -> bool {
        self.column_id == other.column_id
            && self.cluster_info.id == other.cluster_info.id
            && self.global_first == other.global_first
    }

    /// The same elements under another column and cluster id.
    pub(crate) fn with_ids(mut self, column_id: DescriptorId, cluster_id: DescriptorId) -> Self {
        self.column_id = column_id;
        self.cluster_info.id = cluster_id;
        self
    }
}

fn check_element_type<T: ColumnElement>(column_id: DescriptorId, column_type: ColumnType) -> NTupleResult<()> {
    if T::COLUMN_TYPE != column_type {
        ntuple_bail!(
            "column {column_id} stores {column_type} elements, not {}",
            T::COLUMN_TYPE
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Page {
        let mut page = PageMut::new(7, ColumnType::Real32, 4).unwrap();
        page.extend_from_slice(&[1.0f32, 2.0, 3.0]).unwrap();
        Page::new(
            7,
            ColumnType::Real32,
            Bytes::copy_from_slice(page.as_bytes()),
            3,
            105,
            ClusterInfo::new(1, 100),
        )
        .unwrap()
    }

    #[test]
    fn reserved_page_respects_capacity() {
        let mut page = PageMut::new(0, ColumnType::Index, 2).unwrap();
        page.push(1u32).unwrap();
        page.push(3u32).unwrap();
        assert!(page.is_full());
        assert!(page.push(4u32).is_err());
        assert_eq!(page.as_bytes(), &[1, 0, 0, 0, 3, 0, 0, 0]);
        page.clear();
        assert!(page.is_empty());
    }

    #[test]
    fn element_type_must_match() {
        let mut page = PageMut::new(0, ColumnType::Real64, 2).unwrap();
        assert!(page.push(1.0f32).is_err());
        assert!(PageMut::new(0, ColumnType::Unknown, 2).is_err());
        assert!(self::page().values::<f64>().is_err());
    }

    #[test]
    fn global_and_cluster_windows() {
        let page = page();
        assert_eq!(page.global_range(), 105..108);
        assert_eq!(page.cluster_range(), 5..8);
        assert!(page.contains(107));
        assert!(!page.contains(108));
        assert!(page.contains_cluster_index(ClusterIndex::new(1, 5)));
        assert!(!page.contains_cluster_index(ClusterIndex::new(0, 5)));

        assert_eq!(page.get::<f32>(106).unwrap(), 2.0);
        assert_eq!(page.get_in_cluster::<f32>(ClusterIndex::new(1, 7)).unwrap(), 3.0);
        assert!(page.get::<f32>(104).is_err());
        assert_eq!(page.values::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn buffer_size_is_checked() {
        let err = Page::new(
            0,
            ColumnType::Int64,
            Bytes::from_static(&[0; 12]),
            2,
            0,
            ClusterInfo::default(),
        )
        .unwrap_err();
        assert!(err.is_format());
    }
}
