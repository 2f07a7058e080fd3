use std::collections::BTreeMap;
use std::ops::Range;

use crate::{ClusterSize, DescriptorId, Locator, NTupleSize, NTupleVersion};

/// The window of element indexes of a particular column in a particular cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRange {
    pub column_id: DescriptorId,
    /// A 64bit element index
    pub first_element_index: NTupleSize,
    /// A 32bit value for the number of column elements in the cluster
    pub n_elements: ClusterSize,
    /// Compression settings shared by all pages of this column in this cluster, encoded as
    /// `algorithm * 100 + level`.
    pub compression_settings: i64,
}

impl ColumnRange {
    pub fn new(
        column_id: DescriptorId,
        first_element_index: NTupleSize,
        n_elements: ClusterSize,
        compression_settings: i64,
    ) -> Self {
        Self {
            column_id,
            first_element_index,
            n_elements,
            compression_settings,
        }
    }

    pub fn contains(&self, index: NTupleSize) -> bool {
        self.first_element_index <= index && self.end() > index
    }

    /// One past the last global element index covered by this range.
    pub fn end(&self) -> NTupleSize {
        self.first_element_index + NTupleSize::from(self.n_elements)
    }

    pub fn element_range(&self) -> Range<NTupleSize> {
        self.first_element_index..self.end()
    }
}

/// A single page of a column within a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub n_elements: ClusterSize,
    pub locator: Locator,
}

impl PageInfo {
    pub fn new(n_elements: ClusterSize, locator: Locator) -> Self {
        Self {
            n_elements,
            locator,
        }
    }
}

/// Records the partition of data into pages for a particular column in a particular cluster.
///
/// Page `i` covers the cluster-relative element indexes starting at the sum of the element
/// counts of pages `0..i`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageRange {
    pub column_id: DescriptorId,
    page_infos: Vec<PageInfo>,
    /// Cluster-relative index one past the last element of each page.
    element_ends: Vec<NTupleSize>,
}

/// The result of resolving a cluster-relative element index to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLookup<'a> {
    /// Position of the page within its page range.
    pub page_no: usize,
    /// Cluster-relative index of the first element of the page.
    pub first_in_cluster: NTupleSize,
    pub info: &'a PageInfo,
}

impl PageRange {
    pub fn new(column_id: DescriptorId) -> Self {
        Self {
            column_id,
            page_infos: Vec::new(),
            element_ends: Vec::new(),
        }
    }

    pub fn from_pages(column_id: DescriptorId, pages: impl IntoIterator<Item = PageInfo>) -> Self {
        let mut range = Self::new(column_id);
        for info in pages {
            range.push(info);
        }
        range
    }

    /// Append a page after the last one.
    pub fn push(&mut self, info: PageInfo) {
        let end = self.n_elements() + NTupleSize::from(info.n_elements);
        self.element_ends.push(end);
        self.page_infos.push(info);
    }

    pub fn page_infos(&self) -> &[PageInfo] {
        &self.page_infos
    }

    pub fn n_pages(&self) -> usize {
        self.page_infos.len()
    }

    pub fn n_elements(&self) -> NTupleSize {
        self.element_ends.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.page_infos.is_empty()
    }

    /// Cluster-relative index of the first element of page `page_no`.
    pub fn first_in_cluster(&self, page_no: usize) -> Option<NTupleSize> {
        if page_no >= self.page_infos.len() {
            return None;
        }
        Some(
            page_no
                .checked_sub(1)
                .and_then(|prev| self.element_ends.get(prev))
                .copied()
                .unwrap_or(0),
        )
    }

    /// Find the page containing the given cluster-relative element index.
    pub fn find(&self, cluster_index: NTupleSize) -> Option<PageLookup<'_>> {
        let page_no = self.element_ends.partition_point(|&end| end <= cluster_index);
        let info = self.page_infos.get(page_no)?;
        Some(PageLookup {
            page_no,
            first_in_cluster: self.first_in_cluster(page_no)?,
            info,
        })
    }
}

/// Meta-data for a cluster: its entry window, its location, and per column the element window
/// and the pages.
///
/// Every column with a [`ColumnRange`] in the cluster also has a [`PageRange`], possibly empty, so
/// that "no elements in this cluster" is distinguishable from "column not recorded".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub(crate) id: DescriptorId,
    pub(crate) version: NTupleVersion,
    pub(crate) first_entry_index: NTupleSize,
    pub(crate) n_entries: ClusterSize,
    pub(crate) locator: Locator,
    pub(crate) column_ranges: BTreeMap<DescriptorId, ColumnRange>,
    pub(crate) page_ranges: BTreeMap<DescriptorId, PageRange>,
}

impl ClusterDescriptor {
    pub(crate) fn new(
        id: DescriptorId,
        version: NTupleVersion,
        first_entry_index: NTupleSize,
        n_entries: ClusterSize,
    ) -> Self {
        Self {
            id,
            version,
            first_entry_index,
            n_entries,
            locator: Locator::default(),
            column_ranges: BTreeMap::new(),
            page_ranges: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn version(&self) -> NTupleVersion {
        self.version
    }

    pub fn first_entry_index(&self) -> NTupleSize {
        self.first_entry_index
    }

    pub fn n_entries(&self) -> ClusterSize {
        self.n_entries
    }

    pub fn entry_range(&self) -> Range<NTupleSize> {
        self.first_entry_index..self.first_entry_index + NTupleSize::from(self.n_entries)
    }

    /// The byte extent of the whole cluster, for pre-fetching.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// `None` if the column is not recorded in this cluster.
    pub fn column_range(&self, column_id: DescriptorId) -> Option<&ColumnRange> {
        self.column_ranges.get(&column_id)
    }

    /// `None` if the column is not recorded in this cluster; an empty range if it has no pages.
    pub fn page_range(&self, column_id: DescriptorId) -> Option<&PageRange> {
        self.page_ranges.get(&column_id)
    }

    pub fn contains_column(&self, column_id: DescriptorId) -> bool {
        self.column_ranges.contains_key(&column_id)
    }

    /// Ids of the columns recorded in this cluster, in ascending order.
    pub fn column_ids(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        self.column_ranges.keys().copied()
    }

    pub fn column_ranges(&self) -> impl Iterator<Item = &ColumnRange> + '_ {
        self.column_ranges.values()
    }

    pub fn page_ranges(&self) -> impl Iterator<Item = &PageRange> + '_ {
        self.page_ranges.values()
    }

    /// Total bytes on storage of all pages in this cluster.
    pub fn bytes_on_storage(&self) -> u64 {
        self.page_ranges
            .values()
            .flat_map(|r| r.page_infos().iter())
            .map(|p| u64::from(p.locator.bytes_on_storage()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_range_contains() {
        let range = ColumnRange::new(0, 100, 1000, 0);
        assert!(!range.contains(99));
        assert!(range.contains(100));
        assert!(range.contains(1099));
        assert!(!range.contains(1100));
        assert!(!ColumnRange::new(0, 5, 0, 0).contains(5));
    }

    #[test]
    fn page_range_find() {
        let range = PageRange::from_pages(
            3,
            [
                PageInfo::new(10, Locator::new(0, 40)),
                PageInfo::new(0, Locator::new(40, 0)),
                PageInfo::new(5, Locator::new(40, 20)),
            ],
        );
        assert_eq!(range.n_elements(), 15);
        assert_eq!(range.n_pages(), 3);

        let lookup = range.find(9).unwrap();
        assert_eq!((lookup.page_no, lookup.first_in_cluster), (0, 0));
        let lookup = range.find(10).unwrap();
        assert_eq!((lookup.page_no, lookup.first_in_cluster), (2, 10));
        assert_eq!(lookup.info.locator, Locator::new(40, 20));
        assert!(range.find(15).is_none());
        assert!(PageRange::new(3).find(0).is_none());
        assert_eq!(range.first_in_cluster(1), Some(10));
        assert_eq!(range.first_in_cluster(3), None);
    }

    #[test]
    fn page_range_find_many_pages() {
        let range = PageRange::from_pages(
            0,
            (0..10_000u32).map(|i| PageInfo::new(1 + i % 3, Locator::new(i64::from(i), 1))),
        );
        let mut first = 0;
        for (page_no, info) in range.page_infos().iter().enumerate() {
            let n = NTupleSize::from(info.n_elements);
            for index in [first, first + n - 1] {
                let lookup = range.find(index).unwrap();
                assert_eq!((lookup.page_no, lookup.first_in_cluster), (page_no, first));
            }
            first += n;
        }
        assert_eq!(range.n_elements(), first);
        assert!(range.find(first).is_none());
    }
}
