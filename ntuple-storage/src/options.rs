use crate::CompressionSettings;

/// Options of a [`PageSink`](crate::PageSink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    compression: CompressionSettings,
    elements_per_page: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: CompressionSettings::default(),
            elements_per_page: 10_000,
        }
    }
}

impl WriteOptions {
    pub fn with_compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = compression;
        self
    }

    /// The capacity of pages reserved without an explicit size.
    pub fn with_elements_per_page(mut self, elements_per_page: usize) -> Self {
        self.elements_per_page = elements_per_page;
        self
    }

    pub fn compression(&self) -> CompressionSettings {
        self.compression
    }

    pub fn elements_per_page(&self) -> usize {
        self.elements_per_page
    }
}

/// Whether a [`PageSource`](crate::PageSource) populates pages through a background
/// [`ClusterPool`](crate::ClusterPool) or reads them one by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterCacheMode {
    On,
    #[default]
    Off,
}

/// Options of a [`PageSource`](crate::PageSource).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    cluster_cache: ClusterCacheMode,
    cluster_cache_capacity_bytes: u64,
    cluster_pool_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            cluster_cache: ClusterCacheMode::default(),
            cluster_cache_capacity_bytes: 256 << 20,
            cluster_pool_size: 4,
        }
    }
}

impl ReadOptions {
    pub fn with_cluster_cache(mut self, mode: ClusterCacheMode) -> Self {
        self.cluster_cache = mode;
        self
    }

    /// Upper bound of the bytes held by loaded clusters.
    pub fn with_cluster_cache_capacity_bytes(mut self, capacity: u64) -> Self {
        self.cluster_cache_capacity_bytes = capacity;
        self
    }

    /// Number of clusters, including the requested one, that the cluster pool loads ahead.
    pub fn with_cluster_pool_size(mut self, size: usize) -> Self {
        self.cluster_pool_size = size.max(1);
        self
    }

    pub fn cluster_cache(&self) -> ClusterCacheMode {
        self.cluster_cache
    }

    pub fn cluster_cache_capacity_bytes(&self) -> u64 {
        self.cluster_cache_capacity_bytes
    }

    pub fn cluster_pool_size(&self) -> usize {
        self.cluster_pool_size
    }
}
