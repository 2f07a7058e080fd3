use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use itertools::Itertools;
use log::{debug, trace};
use ntuple_descriptor::{
    ClusterIndex, ClusterSize, DescriptorId, Locator, NTupleDescriptor, NTupleSize,
};
use ntuple_error::{NTupleError, NTupleResult, ntuple_bail, ntuple_err};
use ntuple_io::CoalescedRead;
use ntuple_metrics::{Counter, NTupleMetrics, Stopwatch, Timer, as_count, timed};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;

use crate::compress::decompress;
use crate::{
    Cluster, ClusterCache, ClusterCacheMode, ClusterInfo, ClusterPool, Column, ColumnHandle,
    CompressionSettings, OnDiskPageKey, Page, PagePool, PageStorage, PageStorageType, ReadOptions,
    TaskScheduler,
};

/// The physical half of a page source: decodes the metadata and reads sealed pages.
///
/// Backends are shared between the thread populating pages and the cluster pool's I/O thread.
pub trait SourceBackend: Send + Sync + 'static {
    /// Read and decode the header and the footer.
    fn attach(&self) -> NTupleResult<NTupleDescriptor>;

    fn load_page(&self, locator: &Locator) -> NTupleResult<Bytes>;

    /// Read several pages, returned in the order of `locators`.
    fn load_pages(&self, locators: &[Locator]) -> NTupleResult<CoalescedRead> {
        let buffers = locators
            .iter()
            .map(|locator| self.load_page(locator))
            .collect::<NTupleResult<Vec<_>>>()?;
        Ok(CoalescedRead {
            n_requests: buffers.len(),
            bytes_read: buffers.iter().map(|b| b.len() as u64).sum(),
            buffers,
        })
    }

    /// Open the same storage again for an independent reader.
    fn try_clone(&self) -> NTupleResult<Self>
    where
        Self: Sized;
}

/// Loads and unpacks clusters on behalf of a [`ClusterPool`].
pub trait ClusterLoader: Send + Sync {
    fn descriptor(&self) -> Option<Arc<NTupleDescriptor>>;

    /// Read the pages of `columns` in a cluster. The result may hold more columns than asked for.
    fn load_cluster(&self, cluster_id: DescriptorId, columns: &[DescriptorId]) -> NTupleResult<Arc<Cluster>>;

    /// Decompress the pages of a loaded cluster ahead of their population.
    fn unzip_cluster(&self, cluster: &Cluster) -> NTupleResult<()>;

    /// Forget a cluster that is no longer needed.
    fn evict_cluster(&self, cluster_id: DescriptorId);
}

struct SourceCounters {
    n_read: Arc<Counter>,
    n_read_v: Arc<Counter>,
    sz_read_payload: Arc<Counter>,
    sz_read_overhead: Arc<Counter>,
    sz_unzip: Arc<Counter>,
    n_cluster_loaded: Arc<Counter>,
    n_page_loaded: Arc<Counter>,
    n_page_populated: Arc<Counter>,
    time_wall_read: Arc<Timer>,
    time_wall_unzip: Arc<Timer>,
}

impl SourceCounters {
    fn new(metrics: &NTupleMetrics) -> Self {
        Self {
            n_read: metrics.counter("n_read"),
            n_read_v: metrics.counter("n_read_v"),
            sz_read_payload: metrics.counter("sz_read_payload"),
            sz_read_overhead: metrics.counter("sz_read_overhead"),
            sz_unzip: metrics.counter("sz_unzip"),
            n_cluster_loaded: metrics.counter("n_cluster_loaded"),
            n_page_loaded: metrics.counter("n_page_loaded"),
            n_page_populated: metrics.counter("n_page_populated"),
            time_wall_read: metrics.timer("time_wall_read"),
            time_wall_unzip: metrics.timer("time_wall_unzip"),
        }
    }
}

/// The state of a page source that is shared with its cluster pool.
struct SourceCore<B> {
    backend: B,
    descriptor: OnceLock<Arc<NTupleDescriptor>>,
    cache: ClusterCache,
    pages: PagePool,
    scheduler: RwLock<Option<Arc<dyn TaskScheduler>>>,
    counters: SourceCounters,
}

impl<B: SourceBackend> SourceCore<B> {
    fn new(backend: B, options: &ReadOptions, metrics: &NTupleMetrics) -> Self {
        Self {
            backend,
            descriptor: OnceLock::new(),
            cache: ClusterCache::new(options.cluster_cache_capacity_bytes()),
            pages: PagePool::new(),
            scheduler: RwLock::new(None),
            counters: SourceCounters::new(metrics),
        }
    }

    fn attached(&self) -> NTupleResult<&Arc<NTupleDescriptor>> {
        self.descriptor
            .get()
            .ok_or_else(|| ntuple_err!(InvalidState: "page source is not attached"))
    }

    fn read_page(&self, locator: &Locator) -> NTupleResult<Bytes> {
        let bytes = timed(&self.counters.time_wall_read, || self.backend.load_page(locator))?;
        self.counters.n_read.inc();
        self.counters.n_page_loaded.inc();
        self.counters.sz_read_payload.add(as_count(bytes.len()));
        Ok(bytes)
    }
}

impl<B: SourceBackend> ClusterLoader for SourceCore<B> {
    fn descriptor(&self) -> Option<Arc<NTupleDescriptor>> {
        self.descriptor.get().cloned()
    }

    fn load_cluster(&self, cluster_id: DescriptorId, columns: &[DescriptorId]) -> NTupleResult<Arc<Cluster>> {
        let descriptor = self.attached()?;
        let Some(cluster_desc) = descriptor.cluster_descriptor(cluster_id) else {
            ntuple_bail!("unknown cluster {cluster_id}");
        };

        let cached = self.cache.get(cluster_id);
        let missing = columns
            .iter()
            .copied()
            .filter(|&id| !cached.as_ref().is_some_and(|c| c.contains_column(id)))
            .unique()
            .collect::<Vec<_>>();
        if let (Some(cached), true) = (&cached, missing.is_empty()) {
            return Ok(Arc::clone(cached));
        }

        let mut part = Cluster::new(cluster_id);
        let mut keys = Vec::new();
        let mut locators = Vec::new();
        for column_id in missing {
            if descriptor.column_descriptor(column_id).is_none() {
                ntuple_bail!("cannot load unknown column {column_id} of cluster {cluster_id}");
            }
            // a column without pages in the cluster is complete as it is
            if let Some(pages) = cluster_desc.page_range(column_id) {
                for (page_no, info) in pages.page_infos().iter().enumerate() {
                    keys.push(OnDiskPageKey::new(column_id, page_no));
                    locators.push(info.locator.clone());
                }
            }
            part.set_column_available(column_id);
        }

        if !locators.is_empty() {
            let read = timed(&self.counters.time_wall_read, || {
                self.backend.load_pages(&locators)
            })?;
            if read.buffers.len() != locators.len() {
                ntuple_bail!(
                    "read {} of {} pages of cluster {cluster_id}",
                    read.buffers.len(),
                    locators.len()
                );
            }
            let payload: u64 = locators
                .iter()
                .map(|l| u64::from(l.bytes_on_storage()))
                .sum();
            self.counters.n_read_v.inc();
            self.counters.n_read.add(as_count(read.n_requests));
            self.counters.n_page_loaded.add(as_count(locators.len()));
            self.counters.sz_read_payload.add(as_count(payload));
            self.counters
                .sz_read_overhead
                .add(as_count(read.bytes_read.saturating_sub(payload)));
            debug!(
                "loaded {} pages of cluster {cluster_id} in {} requests",
                locators.len(),
                read.n_requests
            );
            for (key, bytes) in keys.into_iter().zip(read.buffers) {
                part.insert(key, bytes);
            }
        }

        let cluster = match cached {
            Some(cached) => {
                let mut merged = Cluster::clone(&cached);
                merged.adopt(part);
                merged
            }
            None => part,
        };
        let cluster = Arc::new(cluster);
        self.cache.insert(Arc::clone(&cluster));
        self.counters.n_cluster_loaded.inc();
        Ok(cluster)
    }

    fn unzip_cluster(&self, cluster: &Cluster) -> NTupleResult<()> {
        let Some(scheduler) = self.scheduler.read().clone() else {
            return Ok(());
        };
        let descriptor = Arc::clone(self.attached()?);
        let first_error = Arc::new(Mutex::new(None::<NTupleError>));
        let watch = Stopwatch::start(Arc::clone(&self.counters.time_wall_unzip));

        scheduler.reset();
        for (&key, sealed) in cluster.pages() {
            let descriptor = Arc::clone(&descriptor);
            let pages = self.pages.clone();
            let sz_unzip = Arc::clone(&self.counters.sz_unzip);
            let first_error = Arc::clone(&first_error);
            let sealed = sealed.clone();
            let cluster_id = cluster.id();
            scheduler.add_task(Box::new(move || {
                match unseal_page(&descriptor, cluster_id, key, sealed, &sz_unzip) {
                    Ok(page) => pages.preload(page),
                    Err(err) => {
                        first_error.lock().get_or_insert(err);
                    }
                }
            }));
        }
        scheduler.wait();
        watch.stop();

        match first_error.lock().take() {
            Some(err) => Err(err.with_context(format!("cannot unzip cluster {}", cluster.id()))),
            None => Ok(()),
        }
    }

    fn evict_cluster(&self, cluster_id: DescriptorId) {
        self.cache.invalidate(cluster_id);
        self.pages.evict_unused(cluster_id);
    }
}

/// Turn the stored bytes of a page into a populated page.
///
/// Pages are stored compressed if and only if their size on storage differs from their packed
/// size.
fn unseal_page(
    descriptor: &NTupleDescriptor,
    cluster_id: DescriptorId,
    key: OnDiskPageKey,
    sealed: Bytes,
    sz_unzip: &Counter,
) -> NTupleResult<Page> {
    let column_id = key.column_id;
    let Some(column) = descriptor.column_descriptor(column_id) else {
        ntuple_bail!("unknown column {column_id}");
    };
    let cluster = descriptor
        .cluster_descriptor(cluster_id)
        .ok_or_else(|| ntuple_err!("unknown cluster {cluster_id}"))?;
    let (Some(range), Some(pages)) = (cluster.column_range(column_id), cluster.page_range(column_id))
    else {
        ntuple_bail!("column {column_id} is not part of cluster {cluster_id}");
    };
    let (Some(info), Some(first_in_cluster)) = (
        pages.page_infos().get(key.page_no),
        pages.first_in_cluster(key.page_no),
    ) else {
        ntuple_bail!(
            "cluster {cluster_id} holds {} pages of column {column_id}, not {}",
            pages.n_pages(),
            key.page_no + 1
        );
    };

    let column_type = column.model().column_type();
    let packed_size = info.n_elements as usize * column_type.element_size();
    let buffer = if sealed.len() == packed_size {
        sealed
    } else {
        let settings = CompressionSettings::from_raw(range.compression_settings);
        let unzipped = decompress(settings, &sealed, packed_size)
            .map_err(|err| err.with_context(format!("page {} of column {column_id} in cluster {cluster_id}", key.page_no)))?;
        sz_unzip.add(as_count(unzipped.len()));
        Bytes::from(unzipped)
    };

    Page::new(
        column_id,
        column_type,
        buffer,
        info.n_elements,
        range.first_element_index + first_in_cluster,
        ClusterInfo::new(cluster_id, range.first_element_index),
    )
}

/// Reads an ntuple page by page or cluster by cluster.
///
/// A source is attached once, then serves pages of the columns registered with
/// [`add_column`](PageStorage::add_column). Populated pages are pooled until every user released
/// them. With [`ClusterCacheMode::On`] pages are taken from clusters that a background
/// [`ClusterPool`] reads ahead; otherwise each page is read on demand.
///
/// A source is driven by one thread. [`clone_source`](Self::clone_source) opens another one over
/// the same storage for a second thread.
pub struct PageSource<B: SourceBackend> {
    core: Arc<SourceCore<B>>,
    active_columns: FxHashSet<DescriptorId>,
    cluster_pool: Option<ClusterPool>,
    options: ReadOptions,
    metrics: NTupleMetrics,
}

impl<B: SourceBackend> PageSource<B> {
    pub fn new(backend: B, options: ReadOptions) -> Self {
        let metrics = NTupleMetrics::default_with_tags([("storage", Cow::Borrowed("source"))]);
        Self {
            core: Arc::new(SourceCore::new(backend, &options, &metrics)),
            active_columns: FxHashSet::default(),
            cluster_pool: None,
            options,
            metrics,
        }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    /// Decode the metadata of the storage. A source is attached at most once.
    pub fn attach(&mut self) -> NTupleResult<()> {
        if self.core.descriptor.get().is_some() {
            ntuple_bail!(InvalidState: "page source is already attached");
        }
        let descriptor = self.core.backend.attach()?;
        debug!(
            "attached to ntuple '{}' with {} entries in {} clusters",
            descriptor.name(),
            descriptor.n_entries(),
            descriptor.n_clusters()
        );
        self.core
            .descriptor
            .set(Arc::new(descriptor))
            .map_err(|_| ntuple_err!(InvalidState: "page source is already attached"))?;
        self.start_cluster_pool()
    }

    fn start_cluster_pool(&mut self) -> NTupleResult<()> {
        if self.options.cluster_cache() == ClusterCacheMode::On && self.cluster_pool.is_none() {
            let loader: Arc<dyn ClusterLoader> = self.core.clone();
            let pool = ClusterPool::new(loader, self.options.cluster_pool_size(), &self.metrics)?;
            self.cluster_pool = Some(pool);
        }
        Ok(())
    }

    /// The metadata, once attached.
    pub fn descriptor(&self) -> Option<&NTupleDescriptor> {
        self.core.descriptor.get().map(Arc::as_ref)
    }

    /// Columns registered with this source.
    pub fn active_columns(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        self.active_columns.iter().copied()
    }

    /// Decompress cluster pages on `scheduler` when clusters are loaded ahead.
    pub fn set_task_scheduler(&self, scheduler: Arc<dyn TaskScheduler>) {
        *self.core.scheduler.write() = Some(scheduler);
    }

    /// The page holding the element at a global index of the column.
    pub fn populate_page(&self, handle: &ColumnHandle, global_index: NTupleSize) -> NTupleResult<Page> {
        let column_id = handle.id();
        if let Some(page) = self.core.pages.get(column_id, global_index) {
            return Ok(page);
        }
        let descriptor = self.core.attached()?;
        let Some(cluster_id) = descriptor.find_cluster_id(column_id, global_index) else {
            return Err(ntuple_err!(OutOfBounds: global_index, 0, descriptor.n_elements(column_id)));
        };
        let first = descriptor
            .cluster_descriptor(cluster_id)
            .and_then(|c| c.column_range(column_id))
            .map(|r| r.first_element_index)
            .ok_or_else(|| ntuple_err!("column {column_id} is not part of cluster {cluster_id}"))?;
        let index = ClusterSize::try_from(global_index - first)?;
        self.populate_page_in_cluster(handle, ClusterIndex::new(cluster_id, index))
    }

    /// The page holding the element at a cluster-relative index of the column.
    pub fn populate_page_in_cluster(&self, handle: &ColumnHandle, index: ClusterIndex) -> NTupleResult<Page> {
        let column_id = handle.id();
        if let Some(page) = self.core.pages.get_in_cluster(column_id, index) {
            return Ok(page);
        }
        let descriptor = self.core.attached()?;
        let cluster_id = index.cluster_id();
        let Some(cluster) = descriptor.cluster_descriptor(cluster_id) else {
            ntuple_bail!("unknown cluster {cluster_id}");
        };
        let Some(pages) = cluster.page_range(column_id) else {
            ntuple_bail!("column {column_id} is not part of cluster {cluster_id}");
        };
        let Some(lookup) = pages.find(NTupleSize::from(index.index())) else {
            return Err(ntuple_err!(
                OutOfBounds: NTupleSize::from(index.index()),
                0,
                pages.n_elements()
            ));
        };
        let key = OnDiskPageKey::new(column_id, lookup.page_no);

        let sealed = match &self.cluster_pool {
            Some(pool) => {
                let mut columns = self.active_columns.iter().copied().collect::<Vec<_>>();
                columns.push(column_id);
                let loaded = pool.get_cluster(cluster_id, &columns)?;
                // unzipping may have preloaded the page
                if let Some(page) = self.core.pages.get_in_cluster(column_id, index) {
                    return Ok(page);
                }
                loaded
                    .on_disk_page(key)
                    .cloned()
                    .ok_or_else(|| ntuple_err!(InvalidState: "cluster {cluster_id} was loaded without page {} of column {column_id}", lookup.page_no))?
            }
            None => match self
                .core
                .cache
                .get(cluster_id)
                .and_then(|c| c.on_disk_page(key).cloned())
            {
                Some(sealed) => sealed,
                None => self.core.read_page(&lookup.info.locator)?,
            },
        };

        let page = timed(&self.core.counters.time_wall_unzip, || {
            unseal_page(descriptor, cluster_id, key, sealed, &self.core.counters.sz_unzip)
        })?;
        self.core.counters.n_page_populated.inc();
        trace!(
            "populated page {} of column {column_id} in cluster {cluster_id} with {} elements",
            lookup.page_no,
            page.n_elements()
        );
        Ok(self.core.pages.register(page))
    }

    /// Read all pages of `columns` in a cluster. Columns without pages in the cluster are
    /// reported as available on the result; loading them again reads nothing.
    pub fn load_cluster(&self, cluster_id: DescriptorId, columns: &[DescriptorId]) -> NTupleResult<Arc<Cluster>> {
        self.core.load_cluster(cluster_id, columns)
    }

    /// Decompress the pages of a loaded cluster into the page pool. Does nothing without a task
    /// scheduler.
    pub fn unzip_cluster(&self, cluster: &Cluster) -> NTupleResult<()> {
        self.core.unzip_cluster(cluster)
    }

    /// An independent source over the same storage. It shares the attached metadata but has its
    /// own page pool and cluster cache.
    pub fn clone_source(&self) -> NTupleResult<Self> {
        let mut clone = Self::new(self.core.backend.try_clone()?, self.options);
        if let Some(descriptor) = self.core.descriptor.get() {
            clone
                .core
                .descriptor
                .set(Arc::clone(descriptor))
                .map_err(|_| ntuple_err!(InvalidState: "cloned page source is already attached"))?;
            clone.start_cluster_pool()?;
        }
        if let Some(scheduler) = self.core.scheduler.read().clone() {
            clone.set_task_scheduler(scheduler);
        }
        Ok(clone)
    }

    #[cfg(test)]
    pub(crate) fn n_pooled_pages(&self) -> usize {
        self.core.pages.len()
    }
}

impl<B: SourceBackend> PageStorage for PageSource<B> {
    fn storage_type(&self) -> PageStorageType {
        PageStorageType::Source
    }

    fn add_column(&mut self, field_id: DescriptorId, column: Column) -> NTupleResult<ColumnHandle> {
        let descriptor = self.core.attached()?;
        let Some(column_id) = descriptor.find_column_id(field_id, column.index()) else {
            ntuple_bail!("field {field_id} has no column {}", column.index());
        };
        if descriptor
            .column_descriptor(column_id)
            .is_some_and(|c| c.model().column_type() != column.model().column_type())
        {
            ntuple_bail!(Schema: "column {column_id} of field {field_id} has a different type");
        }
        self.active_columns.insert(column_id);
        Ok(ColumnHandle::new(column_id, column))
    }

    fn drop_column(&mut self, handle: &ColumnHandle) {
        self.active_columns.remove(&handle.id());
    }

    fn release_page(&self, page: Page) {
        self.core.pages.release(&page);
    }

    fn metrics(&self) -> &NTupleMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::ops::Range;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ntuple_descriptor::{ColumnType, Field, NTupleModel};
    use ntuple_io::ReadAt;
    use ntuple_metrics::Metric;
    use rustc_hash::FxHashMap;

    use super::*;
    use crate::{
        FileSinkBackend, FileSourceBackend, InlineTaskScheduler, PageSink, ThreadPoolTaskScheduler,
        WriteOptions,
    };

    /// Counts the physical reads issued against an in-memory container.
    struct CountingRead {
        inner: Bytes,
        reads: Arc<AtomicUsize>,
    }

    impl ReadAt for CountingRead {
        fn read_byte_range(&self, range: Range<u64>) -> io::Result<Bytes> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_byte_range(range)
        }

        fn size(&self) -> io::Result<u64> {
            self.inner.size()
        }
    }

    type TestSource = PageSource<FileSourceBackend<CountingRead>>;

    /// Cluster 0 holds `x = 0..100` in two pages and no flags, cluster 1 holds `x = 100..150`
    /// and 50 flags.
    fn container() -> Bytes {
        let model = NTupleModel::new()
            .with_field(Field::leaf("x", "std::int64_t", ColumnType::Int64))
            .with_field(Field::leaf("flag", "bool", ColumnType::Bit));
        let mut sink = PageSink::new("test", FileSinkBackend::new(Vec::new()), WriteOptions::default());
        let handles = sink.create(&model).unwrap();

        for chunk in (0..100i64).collect::<Vec<_>>().chunks(60) {
            let mut page = sink.reserve_page(&handles[0], 0).unwrap();
            page.extend_from_slice(chunk).unwrap();
            sink.commit_page(&handles[0], &page).unwrap();
        }
        sink.commit_cluster(100).unwrap();

        let mut page = sink.reserve_page(&handles[0], 0).unwrap();
        page.extend_from_slice(&(100..150i64).collect::<Vec<_>>()).unwrap();
        sink.commit_page(&handles[0], &page).unwrap();
        let mut flags = sink.reserve_page(&handles[1], 0).unwrap();
        flags.extend_from_slice(&[true; 50]).unwrap();
        sink.commit_page(&handles[1], &flags).unwrap();
        sink.commit_cluster(50).unwrap();

        sink.commit_dataset().unwrap();
        Bytes::from(sink.into_backend().into_inner())
    }

    fn attached(options: ReadOptions) -> (TestSource, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let read = CountingRead {
            inner: container(),
            reads: Arc::clone(&reads),
        };
        let mut source = PageSource::new(FileSourceBackend::new(read), options);
        source.attach().unwrap();
        (source, reads)
    }

    fn handles(source: &mut TestSource) -> (ColumnHandle, ColumnHandle) {
        let (x, flag) = {
            let desc = source.descriptor().unwrap();
            (desc.find_field_id("x").unwrap(), desc.find_field_id("flag").unwrap())
        };
        (
            source
                .add_column(x, Column::new(ColumnType::Int64.into(), 0))
                .unwrap(),
            source
                .add_column(flag, Column::new(ColumnType::Bit.into(), 0))
                .unwrap(),
        )
    }

    #[test]
    fn global_and_cluster_indexes_agree() {
        let (mut source, _) = attached(ReadOptions::default());
        let (x, _) = handles(&mut source);

        let page = source.populate_page(&x, 75).unwrap();
        assert_eq!(page.global_range(), 60..100);
        assert_eq!(page.get::<i64>(75).unwrap(), 75);
        let same = source
            .populate_page_in_cluster(&x, ClusterIndex::new(0, 75))
            .unwrap();
        assert!(same.is_same_page(&page));

        let next = source.populate_page(&x, 120).unwrap();
        assert_eq!(next.cluster_info(), ClusterInfo::new(1, 100));
        assert_eq!(next.get_in_cluster::<i64>(ClusterIndex::new(1, 20)).unwrap(), 120);
        assert!(matches!(
            source.populate_page(&x, 150),
            Err(NTupleError::OutOfBounds(150, 0, 150, _))
        ));

        for page in [page, same, next] {
            source.release_page(page);
        }
        assert!(source.core.pages.is_empty());
    }

    #[test]
    fn pooled_pages_are_read_once() {
        let (mut source, reads) = attached(ReadOptions::default());
        let (x, _) = handles(&mut source);
        let before = reads.load(Ordering::SeqCst);
        let a = source.populate_page(&x, 10).unwrap();
        let b = source.populate_page(&x, 20).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), before + 1);
        source.release_page(a);
        source.release_page(b);
    }

    #[test]
    fn empty_column_is_available_without_reads() {
        let (mut source, reads) = attached(ReadOptions::default());
        let (_, flag) = handles(&mut source);
        let before = reads.load(Ordering::SeqCst);

        let cluster = source.load_cluster(0, &[flag.id()]).unwrap();
        assert!(cluster.contains_column(flag.id()));
        assert_eq!(cluster.n_pages(), 0);
        let again = source.load_cluster(0, &[flag.id()]).unwrap();
        assert!(again.contains_column(flag.id()));
        assert_eq!(reads.load(Ordering::SeqCst), before);
    }

    #[test]
    fn clusters_grow_and_unzip_into_the_pool() {
        let (mut source, reads) = attached(ReadOptions::default());
        let (x, flag) = handles(&mut source);

        let first = source.load_cluster(1, &[x.id()]).unwrap();
        assert_eq!(first.n_pages(), 1);
        let both = source.load_cluster(1, &[x.id(), flag.id()]).unwrap();
        assert_eq!(both.n_pages(), 2);
        assert!(both.contains_column(x.id()) && both.contains_column(flag.id()));
        assert!(source.load_cluster(1, &[99]).is_err());
        assert!(source.load_cluster(7, &[x.id()]).is_err());

        source.unzip_cluster(&both).unwrap();
        assert!(source.core.pages.is_empty());
        source.set_task_scheduler(Arc::new(InlineTaskScheduler));
        source.unzip_cluster(&both).unwrap();
        assert_eq!(source.core.pages.len(), 2);

        let before = reads.load(Ordering::SeqCst);
        let page = source.populate_page(&flag, 10).unwrap();
        assert!(page.get::<bool>(10).unwrap());
        assert_eq!(reads.load(Ordering::SeqCst), before);
        source.release_page(page);
    }

    #[test]
    fn attach_once() {
        let mut source = PageSource::new(FileSourceBackend::new(container()), ReadOptions::default());
        assert!(source.descriptor().is_none());
        assert!(source.load_cluster(0, &[]).is_err());
        assert!(
            source
                .add_column(1, Column::new(ColumnType::Int64.into(), 0))
                .is_err()
        );

        source.attach().unwrap();
        assert!(matches!(source.attach(), Err(NTupleError::InvalidState(..))));
        assert_eq!(source.descriptor().unwrap().n_entries(), 150);
        assert_eq!(source.storage_type(), PageStorageType::Source);
    }

    #[test]
    fn cloned_source_has_its_own_pool() {
        let (source, _) = attached(ReadOptions::default());
        let mut clone = source.clone_source().unwrap();
        assert_eq!(clone.descriptor(), source.descriptor());

        let (x, _) = handles(&mut clone);
        let page = clone.populate_page(&x, 5).unwrap();
        assert_eq!(page.get::<i64>(5).unwrap(), 5);
        assert!(source.core.pages.is_empty());
        assert_eq!(clone.core.pages.len(), 1);
        clone.release_page(page);
    }

    #[test]
    fn cluster_pool_serves_pages() {
        let options = ReadOptions::default()
            .with_cluster_cache(ClusterCacheMode::On)
            .with_cluster_pool_size(2);
        let (mut source, _) = attached(options);
        source.set_task_scheduler(Arc::new(ThreadPoolTaskScheduler::new(2).unwrap()));
        let (x, flag) = handles(&mut source);

        for i in [0u64, 70, 130, 99] {
            let page = source.populate_page(&x, i).unwrap();
            assert_eq!(page.get::<i64>(i).unwrap(), i64::try_from(i).unwrap());
            source.release_page(page);
        }
        let page = source.populate_page(&flag, 3).unwrap();
        assert!(page.get::<bool>(3).unwrap());
        source.release_page(page);
    }

    /// Five clusters of one page each, holding `x = 0..50`.
    fn five_clusters() -> Bytes {
        let model = NTupleModel::new().with_field(Field::leaf("x", "std::int64_t", ColumnType::Int64));
        let mut sink = PageSink::new("five", FileSinkBackend::new(Vec::new()), WriteOptions::default());
        let handles = sink.create(&model).unwrap();
        for cluster in 0..5i64 {
            let mut page = sink.reserve_page(&handles[0], 10).unwrap();
            page.extend_from_slice(&(cluster * 10..(cluster + 1) * 10).collect::<Vec<_>>())
                .unwrap();
            sink.commit_page(&handles[0], &page).unwrap();
            sink.commit_cluster(10).unwrap();
        }
        sink.commit_dataset().unwrap();
        Bytes::from(sink.into_backend().into_inner())
    }

    #[test]
    fn skipped_clusters_leave_no_pages_behind() {
        let options = ReadOptions::default()
            .with_cluster_cache(ClusterCacheMode::On)
            .with_cluster_pool_size(2);
        let mut source = PageSource::new(FileSourceBackend::new(five_clusters()), options);
        source.attach().unwrap();
        source.set_task_scheduler(Arc::new(InlineTaskScheduler));
        let x_field = source.descriptor().unwrap().find_field_id("x").unwrap();
        let x = source
            .add_column(x_field, Column::new(ColumnType::Int64.into(), 0))
            .unwrap();

        // cluster 1 is loaded ahead of entry 0 but never used
        for i in [0u64, 30, 40] {
            let page = source.populate_page(&x, i).unwrap();
            assert_eq!(page.get::<i64>(i).unwrap(), i64::try_from(i).unwrap());
            source.release_page(page);
        }

        let mut counters = FxHashMap::default();
        source.metrics().for_each_metric(|id, metric| {
            if let Metric::Counter(counter) = metric {
                counters.insert(id.name().to_string(), counter.count());
            }
        });
        assert_eq!(counters.get("n_cluster_scheduled"), Some(&4));
        assert_eq!(counters.get("n_cluster_evicted"), Some(&2));

        let core = Arc::clone(&source.core);
        drop(source);
        for cluster_id in 0..3 {
            assert!(
                core.pages
                    .get_in_cluster(x.id(), ClusterIndex::new(cluster_id, 0))
                    .is_none(),
                "cluster {cluster_id} still has pooled pages"
            );
        }
    }
}
