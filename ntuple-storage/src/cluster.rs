use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use moka::policy::EvictionPolicy;
use moka::sync::{Cache, CacheBuilder};
use ntuple_descriptor::DescriptorId;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

/// Addresses the `page_no`-th page of a column within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OnDiskPageKey {
    pub column_id: DescriptorId,
    pub page_no: usize,
}

impl OnDiskPageKey {
    pub fn new(column_id: DescriptorId, page_no: usize) -> Self {
        Self { column_id, page_no }
    }
}

/// The pages of some columns of a cluster, as they were read from storage.
///
/// A column is *available* once all of its pages in the cluster are present. Columns without
/// pages in the cluster are available without holding any page, which tells them apart from
/// columns that were never requested.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    id: DescriptorId,
    pages: FxHashMap<OnDiskPageKey, Bytes>,
    available_columns: FxHashSet<DescriptorId>,
}

impl Cluster {
    pub fn new(id: DescriptorId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn insert(&mut self, key: OnDiskPageKey, bytes: Bytes) {
        self.pages.insert(key, bytes);
    }

    pub fn set_column_available(&mut self, column_id: DescriptorId) {
        self.available_columns.insert(column_id);
    }

    pub fn contains_column(&self, column_id: DescriptorId) -> bool {
        self.available_columns.contains(&column_id)
    }

    pub fn available_columns(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        self.available_columns.iter().copied()
    }

    pub fn on_disk_page(&self, key: OnDiskPageKey) -> Option<&Bytes> {
        self.pages.get(&key)
    }

    pub fn pages(&self) -> impl Iterator<Item = (&OnDiskPageKey, &Bytes)> + '_ {
        self.pages.iter()
    }

    pub fn n_pages(&self) -> usize {
        self.pages.len()
    }

    /// Bytes held by the on-disk pages.
    pub fn n_bytes(&self) -> usize {
        self.pages.values().map(Bytes::len).sum()
    }

    /// Move the pages and available columns of another part of the same cluster into this one.
    pub fn adopt(&mut self, other: Cluster) {
        debug_assert_eq!(self.id, other.id, "cannot merge parts of different clusters");
        self.pages.extend(other.pages);
        self.available_columns.extend(other.available_columns);
    }
}

/// Loaded clusters shared between the threads of a page source, bounded by their size in bytes.
#[derive(Clone)]
pub struct ClusterCache(Cache<DescriptorId, Arc<Cluster>, FxBuildHasher>);

impl ClusterCache {
    pub fn new(max_capacity_bytes: u64) -> Self {
        Self(
            CacheBuilder::new(max_capacity_bytes)
                .name("ntuple-cluster-cache")
                .weigher(|_, cluster: &Arc<Cluster>| {
                    u32::try_from(cluster.n_bytes()).unwrap_or(u32::MAX)
                })
                .eviction_policy(EvictionPolicy::lru())
                .build_with_hasher(FxBuildHasher),
        )
    }

    pub fn get(&self, cluster_id: DescriptorId) -> Option<Arc<Cluster>> {
        let cluster = self.0.get(&cluster_id);
        if cluster.is_some() {
            debug!("cluster {cluster_id} found in cache");
        }
        cluster
    }

    pub fn insert(&self, cluster: Arc<Cluster>) {
        self.0.insert(cluster.id(), cluster);
    }

    pub fn invalidate(&self, cluster_id: DescriptorId) {
        self.0.invalidate(&cluster_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_merges_columns() {
        let mut cluster = Cluster::new(3);
        cluster.insert(OnDiskPageKey::new(0, 0), Bytes::from_static(b"abcd"));
        cluster.set_column_available(0);

        let mut other = Cluster::new(3);
        other.set_column_available(1);
        cluster.adopt(other);

        assert!(cluster.contains_column(0));
        assert!(cluster.contains_column(1));
        assert!(!cluster.contains_column(2));
        assert_eq!(cluster.n_pages(), 1);
        assert_eq!(cluster.n_bytes(), 4);
        assert_eq!(
            cluster.on_disk_page(OnDiskPageKey::new(0, 0)).map(Bytes::as_ref),
            Some(b"abcd".as_slice())
        );
    }

    #[test]
    fn cache_returns_inserted_clusters() {
        let cache = ClusterCache::new(1 << 20);
        let mut cluster = Cluster::new(5);
        cluster.set_column_available(2);
        cache.insert(Arc::new(cluster));
        assert!(cache.get(5).is_some_and(|c| c.contains_column(2)));
        assert!(cache.get(6).is_none());
        cache.invalidate(5);
        assert!(cache.get(5).is_none());
    }
}
