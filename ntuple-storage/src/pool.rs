use std::sync::Arc;

use dashmap::DashMap;
use log::trace;
use ntuple_descriptor::{ClusterIndex, DescriptorId, NTupleSize};
use rustc_hash::FxBuildHasher;

use crate::Page;

/// A registry of the populated pages of a page source.
///
/// Pages handed out to callers are reference counted; a page is dropped from the pool when its
/// last user releases it. Pages preloaded by unzipping a cluster enter the pool with a count of
/// zero and are handed out by the next lookup. Cloning yields a handle to the same pool.
#[derive(Debug, Clone, Default)]
pub struct PagePool {
    pages: Arc<DashMap<DescriptorId, Vec<PoolEntry>, FxBuildHasher>>,
}

#[derive(Debug)]
struct PoolEntry {
    page: Page,
    ref_count: usize,
}

impl PagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a page that is handed out to a caller right away. If the same page is already pooled,
    /// the pooled page is used instead.
    pub fn register(&self, page: Page) -> Page {
        let mut entries = self.pages.entry(page.column_id()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.page.is_same_page(&page)) {
            entry.ref_count += 1;
            return entry.page.clone();
        }
        entries.push(PoolEntry {
            page: page.clone(),
            ref_count: 1,
        });
        page
    }

    /// Add a page that no caller holds yet.
    pub fn preload(&self, page: Page) {
        let mut entries = self.pages.entry(page.column_id()).or_default();
        if entries.iter().any(|e| e.page.is_same_page(&page)) {
            return;
        }
        trace!(
            "preloaded page of column {} covering elements {}..{}",
            page.column_id(),
            page.global_range().start,
            page.global_range().end
        );
        entries.push(PoolEntry { page, ref_count: 0 });
    }

    /// Hand out the pooled page containing a global element index.
    pub fn get(&self, column_id: DescriptorId, global_index: NTupleSize) -> Option<Page> {
        self.acquire(column_id, |page| page.contains(global_index))
    }

    /// Hand out the pooled page containing a cluster-relative element index.
    pub fn get_in_cluster(&self, column_id: DescriptorId, index: ClusterIndex) -> Option<Page> {
        self.acquire(column_id, |page| page.contains_cluster_index(index))
    }

    fn acquire(&self, column_id: DescriptorId, matches: impl Fn(&Page) -> bool) -> Option<Page> {
        let mut entries = self.pages.get_mut(&column_id)?;
        let entry = entries.iter_mut().find(|e| matches(&e.page))?;
        entry.ref_count += 1;
        Some(entry.page.clone())
    }

    /// Return a page previously handed out by this pool.
    pub fn release(&self, page: &Page) {
        let Some(mut entries) = self.pages.get_mut(&page.column_id()) else {
            return;
        };
        if let Some(pos) = entries.iter().position(|e| e.page.is_same_page(page)) {
            let entry = &mut entries[pos];
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                entries.swap_remove(pos);
            }
        }
        let now_empty = entries.is_empty();
        drop(entries);
        if now_empty {
            self.pages.remove_if(&page.column_id(), |_, entries| entries.is_empty());
        }
    }

    /// Drop the preloaded pages of a cluster that no caller holds.
    pub fn evict_unused(&self, cluster_id: DescriptorId) {
        self.pages.retain(|_, entries| {
            entries.retain(|e| e.ref_count > 0 || e.page.cluster_info().id() != cluster_id);
            !entries.is_empty()
        });
    }

    /// Number of pooled pages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ntuple_descriptor::ColumnType;

    use super::*;
    use crate::ClusterInfo;

    fn page(column_id: DescriptorId, first: NTupleSize) -> Page {
        Page::new(
            column_id,
            ColumnType::Byte,
            Bytes::from_static(&[1, 2, 3, 4]),
            4,
            first,
            ClusterInfo::new(0, 0),
        )
        .unwrap()
    }

    #[test]
    fn pages_live_until_last_release() {
        let pool = PagePool::new();
        let first = pool.register(page(1, 0));
        let again = pool.get(1, 3).unwrap();
        assert!(pool.get(1, 4).is_none());
        assert_eq!(pool.len(), 1);

        pool.release(&first);
        assert!(!pool.is_empty());
        pool.release(&again);
        assert!(pool.is_empty());
        assert!(pool.get(1, 0).is_none());
    }

    #[test]
    fn preloaded_pages_are_handed_out_once() {
        let pool = PagePool::new();
        pool.preload(page(2, 4));
        pool.preload(page(2, 4));
        assert_eq!(pool.len(), 1);

        let page = pool
            .get_in_cluster(2, ClusterIndex::new(0, 5))
            .unwrap();
        assert_eq!(page.global_range(), 4..8);
        pool.release(&page);
        assert!(pool.is_empty());
    }

    #[test]
    fn eviction_keeps_pages_in_use() {
        let pool = PagePool::new();
        pool.preload(page(4, 0));
        let held = pool.register(page(5, 0));
        pool.evict_unused(0);
        assert_eq!(pool.len(), 1);
        assert!(pool.get(4, 0).is_none());
        pool.release(&held);
    }

    #[test]
    fn register_reuses_pooled_page() {
        let pool = PagePool::new();
        pool.preload(page(3, 0));
        let page = pool.register(page(3, 0));
        assert_eq!(pool.len(), 1);
        pool.release(&page);
        assert!(pool.is_empty());
    }
}
