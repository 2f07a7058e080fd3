use std::borrow::Cow;
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use jiff::Timestamp;
use log::debug;
use ntuple_descriptor::{
    ClusterSize, ColumnRange, DescriptorId, Field, FieldDescriptor, FieldStructure, Locator,
    NTupleDescriptor, NTupleDescriptorBuilder, NTupleModel, NTupleSize, NTupleVersion, PageInfo,
    PageRange,
};
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};
use ntuple_metrics::{Counter, NTupleMetrics, Timer, as_count, timed};

use crate::{
    Column, ColumnHandle, Page, PageMut, PageStorage, PageStorageType, SealedPage, WriteOptions,
};

/// The physical half of a page sink: writes bytes and reports where they went.
///
/// Calls arrive in protocol order: `create` once, then any number of pages and clusters, then
/// `commit_dataset` once.
pub trait SinkBackend: Send {
    /// Prepare the storage for a dataset with the given schema.
    fn create(&mut self, descriptor: &NTupleDescriptor) -> NTupleResult<()>;

    /// Write the sealed (possibly compressed) bytes of a page.
    fn commit_page(&mut self, column_id: DescriptorId, sealed: &[u8]) -> NTupleResult<Locator>;

    /// Close the pages written since the previous cluster, returning the extent they occupy.
    fn commit_cluster(&mut self, n_entries: ClusterSize) -> NTupleResult<Locator>;

    /// Persist the metadata of the dataset. Must be durable once it returns.
    fn commit_dataset(&mut self, descriptor: &NTupleDescriptor) -> NTupleResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Init,
    Open,
    Committed,
}

struct SinkCounters {
    n_page_committed: Arc<Counter>,
    sz_write_payload: Arc<Counter>,
    sz_zip: Arc<Counter>,
    time_wall_write: Arc<Timer>,
    time_wall_zip: Arc<Timer>,
}

impl SinkCounters {
    fn new(metrics: &NTupleMetrics) -> Self {
        Self {
            n_page_committed: metrics.counter("n_page_committed"),
            sz_write_payload: metrics.counter("sz_write_payload"),
            sz_zip: metrics.counter("sz_zip"),
            time_wall_write: metrics.timer("time_wall_write"),
            time_wall_zip: metrics.timer("time_wall_zip"),
        }
    }
}

/// Writes an ntuple page by page and cluster by cluster, recording the layout in a descriptor.
///
/// The sink assigns field, column and cluster ids and drives an [`NTupleDescriptorBuilder`];
/// the backend only moves bytes. A sink is used from a single thread.
pub struct PageSink<B> {
    name: String,
    backend: B,
    options: WriteOptions,
    builder: NTupleDescriptorBuilder,
    state: SinkState,
    next_field_id: DescriptorId,
    next_column_id: DescriptorId,
    next_cluster_id: DescriptorId,
    n_entries_committed: NTupleSize,
    open_column_ranges: BTreeMap<DescriptorId, ColumnRange>,
    open_page_ranges: BTreeMap<DescriptorId, PageRange>,
    metrics: NTupleMetrics,
    counters: SinkCounters,
}

impl<B: SinkBackend> PageSink<B> {
    pub fn new(name: impl Into<String>, backend: B, options: WriteOptions) -> Self {
        let name = name.into();
        let metrics = NTupleMetrics::default_with_tags([
            ("storage", Cow::Borrowed("sink")),
            ("ntuple", Cow::Owned(name.clone())),
        ]);
        let counters = SinkCounters::new(&metrics);
        Self {
            name,
            backend,
            options,
            builder: NTupleDescriptorBuilder::new(),
            state: SinkState::Init,
            next_field_id: 0,
            next_column_id: 0,
            next_cluster_id: 0,
            n_entries_committed: 0,
            open_column_ranges: BTreeMap::new(),
            open_page_ranges: BTreeMap::new(),
            metrics,
            counters,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// The layout recorded so far.
    pub fn descriptor(&self) -> &NTupleDescriptor {
        self.builder.descriptor()
    }

    /// Number of entries in the committed clusters.
    pub fn n_entries(&self) -> NTupleSize {
        self.n_entries_committed
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Assign ids to the fields and columns of `model`, depth first with every field before its
    /// children, and prepare the backend. Returns a handle per column in id order.
    pub fn create(&mut self, model: &NTupleModel) -> NTupleResult<Vec<ColumnHandle>> {
        if self.state != SinkState::Init {
            ntuple_bail!(InvalidState: "ntuple '{}' is already created", self.name);
        }
        self.options.compression().validate()?;

        let handles = match self.create_schema(model) {
            Ok(handles) => handles,
            Err(err) => {
                self.reset_schema();
                return Err(err.with_context(format!("cannot create ntuple '{}'", self.name)));
            }
        };
        if let Err(err) = self.backend.create(self.builder.descriptor()) {
            self.reset_schema();
            return Err(err);
        }

        debug!(
            "created ntuple '{}' with {} fields and {} columns",
            self.name,
            self.next_field_id,
            self.next_column_id
        );
        self.state = SinkState::Open;
        Ok(handles)
    }

    fn create_schema(&mut self, model: &NTupleModel) -> NTupleResult<Vec<ColumnHandle>> {
        self.builder.set_ntuple(
            self.name.clone(),
            model.description(),
            model.author(),
            model.version(),
            model.uuid(),
        )?;
        // stored with microsecond precision
        let now = Timestamp::from_microsecond(Timestamp::now().as_microsecond())
            .map_err(|err| ntuple_err!("cannot take the current time: {err}"))?;
        self.builder.set_time_stamps(now, now);

        let root_id = self.allocate_field_id();
        self.builder
            .add_field(FieldDescriptor::new(root_id, "", "", FieldStructure::Record))?;

        let mut handles = Vec::new();
        for field in model.fields() {
            self.add_field_tree(field, root_id, &mut handles)?;
        }
        Ok(handles)
    }

    fn add_field_tree(
        &mut self,
        field: &Field,
        parent_id: DescriptorId,
        handles: &mut Vec<ColumnHandle>,
    ) -> NTupleResult<()> {
        let field_id = self.allocate_field_id();
        self.builder.add_field(
            FieldDescriptor::new(field_id, field.name(), field.type_name(), field.structure())
                .with_description(field.description())
                .with_n_repetitions(field.n_repetitions())
                .with_field_version(field.field_version())
                .with_type_version(field.type_version()),
        )?;
        self.builder.add_field_link(parent_id, field_id)?;

        for (index, model) in field.columns().iter().enumerate() {
            let column = Column::new(*model, u32::try_from(index)?);
            let column_id = self.next_column_id;
            self.builder
                .add_column(column_id, field_id, column.version(), column.model(), column.index())?;
            self.next_column_id += 1;
            self.open_column_ranges.insert(
                column_id,
                ColumnRange::new(column_id, 0, 0, self.options.compression().raw()),
            );
            self.open_page_ranges
                .insert(column_id, PageRange::new(column_id));
            handles.push(ColumnHandle::new(column_id, column));
        }

        for child in field.children() {
            self.add_field_tree(child, field_id, handles)?;
        }
        Ok(())
    }

    fn allocate_field_id(&mut self) -> DescriptorId {
        let id = self.next_field_id;
        self.next_field_id += 1;
        id
    }

    fn reset_schema(&mut self) {
        self.builder = NTupleDescriptorBuilder::new();
        self.next_field_id = 0;
        self.next_column_id = 0;
        self.open_column_ranges.clear();
        self.open_page_ranges.clear();
    }

    pub(crate) fn ensure_open(&self, operation: &str) -> NTupleResult<()> {
        match self.state {
            SinkState::Open => Ok(()),
            SinkState::Init => {
                ntuple_bail!(InvalidState: "cannot {operation} before ntuple '{}' is created", self.name)
            }
            SinkState::Committed => {
                ntuple_bail!(InvalidState: "cannot {operation} after ntuple '{}' is committed", self.name)
            }
        }
    }

    /// Allocate a page for the column to fill before committing it. A capacity of zero picks
    /// the configured number of elements per page.
    pub fn reserve_page(&self, handle: &ColumnHandle, n_elements: usize) -> NTupleResult<PageMut> {
        let Some(column) = self.builder.descriptor().column_descriptor(handle.id()) else {
            ntuple_bail!("cannot reserve a page for unknown column {}", handle.id());
        };
        let capacity = if n_elements == 0 {
            self.options.elements_per_page()
        } else {
            n_elements
        };
        PageMut::new(column.id(), column.model().column_type(), capacity)
    }

    /// Write a page and append it to the open page range of its column.
    ///
    /// Nothing is recorded unless the backend stored the page.
    pub fn commit_page(&mut self, handle: &ColumnHandle, page: &PageMut) -> NTupleResult<()> {
        self.ensure_open("commit a page")?;
        check_page_column(handle, page.column_id())?;
        let n_elements = ClusterSize::try_from(page.n_elements())?;
        let compression = self.options.compression();
        let sealed = timed(&self.counters.time_wall_zip, || {
            SealedPage::seal(
                page.column_id(),
                n_elements,
                Bytes::copy_from_slice(page.as_bytes()),
                compression,
            )
        })?;
        self.commit_sealed_page(handle, &sealed)
    }

    /// Write a page sealed ahead of time, e.g. on another thread.
    pub fn commit_sealed_page(&mut self, handle: &ColumnHandle, page: &SealedPage) -> NTupleResult<()> {
        self.ensure_open("commit a page")?;
        check_page_column(handle, page.column_id())?;
        let column_id = handle.id();
        let n_elements = page.n_elements();
        let Some(open_elements) = self
            .open_column_ranges
            .get(&column_id)
            .map(|range| range.n_elements)
        else {
            ntuple_bail!("cannot commit a page to unknown column {column_id}");
        };
        let Some(total) = open_elements.checked_add(n_elements) else {
            ntuple_bail!(
                "column {column_id} cannot hold more than {} elements in cluster {}",
                ClusterSize::MAX,
                self.next_cluster_id
            );
        };
        if n_elements == 0 {
            debug!("skipping empty page of column {column_id}");
            return Ok(());
        }

        let sealed = page.buffer();
        let locator = timed(&self.counters.time_wall_write, || {
            self.backend.commit_page(column_id, sealed)
        })?;

        self.counters.n_page_committed.inc();
        self.counters.sz_write_payload.add(as_count(sealed.len()));
        if page.is_compressed() {
            self.counters.sz_zip.add(as_count(page.packed_size()));
        }
        debug!(
            "committed page of column {column_id} with {n_elements} elements, {} bytes at {}",
            sealed.len(),
            locator.position()
        );

        if let Some(range) = self.open_column_ranges.get_mut(&column_id) {
            range.n_elements = total;
        }
        if let Some(pages) = self.open_page_ranges.get_mut(&column_id) {
            pages.push(PageInfo::new(n_elements, locator));
        }
        Ok(())
    }

    /// Close the open cluster with the given number of entries and start the next one.
    pub fn commit_cluster(&mut self, n_entries: ClusterSize) -> NTupleResult<()> {
        self.ensure_open("commit a cluster")?;
        let cluster_id = self.next_cluster_id;
        let locator = self.backend.commit_cluster(n_entries)?;

        self.builder.add_cluster(
            cluster_id,
            NTupleVersion::default(),
            self.n_entries_committed,
            n_entries,
        )?;
        self.builder.set_cluster_locator(cluster_id, locator)?;
        for (column_id, range) in self.open_column_ranges.iter_mut() {
            self.builder
                .add_cluster_column_range(cluster_id, range.clone())?;
            let pages = self
                .open_page_ranges
                .get_mut(column_id)
                .map(|pages| mem::replace(pages, PageRange::new(*column_id)))
                .ok_or_else(|| ntuple_err!(InvalidState: "no open page range for column {column_id}"))?;
            self.builder.add_cluster_page_range(cluster_id, pages)?;

            range.first_element_index = range.end();
            range.n_elements = 0;
        }

        debug!(
            "committed cluster {cluster_id} of ntuple '{}' with entries {}..{}",
            self.name,
            self.n_entries_committed,
            self.n_entries_committed + NTupleSize::from(n_entries)
        );
        self.n_entries_committed += NTupleSize::from(n_entries);
        self.next_cluster_id += 1;
        Ok(())
    }

    /// Persist the metadata. The sink accepts no further commits afterwards.
    pub fn commit_dataset(&mut self) -> NTupleResult<()> {
        self.ensure_open("commit the dataset")?;
        if let Some(pages) = self.open_page_ranges.values().find(|p| !p.is_empty()) {
            ntuple_bail!(
                InvalidState: "column {} has {} pages outside of a committed cluster",
                pages.column_id,
                pages.n_pages()
            );
        }
        self.backend.commit_dataset(self.builder.descriptor())?;
        self.state = SinkState::Committed;
        debug!(
            "committed ntuple '{}' with {} clusters and {} entries",
            self.name,
            self.next_cluster_id,
            self.n_entries_committed
        );
        Ok(())
    }
}

fn check_page_column(handle: &ColumnHandle, page_column_id: DescriptorId) -> NTupleResult<()> {
    if page_column_id != handle.id() {
        ntuple_bail!(
            "page of column {page_column_id} cannot be committed to column {}",
            handle.id()
        );
    }
    Ok(())
}

impl<B: SinkBackend> PageStorage for PageSink<B> {
    fn storage_type(&self) -> PageStorageType {
        PageStorageType::Sink
    }

    fn add_column(&mut self, field_id: DescriptorId, column: Column) -> NTupleResult<ColumnHandle> {
        let descriptor = self.builder.descriptor();
        let Some(column_id) = descriptor.find_column_id(field_id, column.index()) else {
            ntuple_bail!("field {field_id} has no column {}", column.index());
        };
        if descriptor
            .column_descriptor(column_id)
            .is_some_and(|c| c.model() != column.model())
        {
            ntuple_bail!(Schema: "column {column_id} of field {field_id} has a different model");
        }
        Ok(ColumnHandle::new(column_id, column))
    }

    fn drop_column(&mut self, _handle: &ColumnHandle) {}

    fn release_page(&self, page: Page) {
        drop(page);
    }

    fn metrics(&self) -> &NTupleMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use ntuple_descriptor::ColumnType;
    use ntuple_metrics::Metric;

    use super::*;
    use crate::CompressionSettings;

    /// Records what the sink asks for in memory.
    #[derive(Default)]
    struct RecordingBackend {
        created: bool,
        pages: Vec<(DescriptorId, Vec<u8>)>,
        clusters: usize,
        committed: Option<NTupleDescriptor>,
        fail_writes: bool,
        position: i64,
    }

    impl SinkBackend for RecordingBackend {
        fn create(&mut self, _descriptor: &NTupleDescriptor) -> NTupleResult<()> {
            self.created = true;
            Ok(())
        }

        fn commit_page(&mut self, column_id: DescriptorId, sealed: &[u8]) -> NTupleResult<Locator> {
            if self.fail_writes {
                ntuple_bail!("disk full");
            }
            let locator = Locator::new(self.position, u32::try_from(sealed.len())?);
            self.position += i64::try_from(sealed.len())?;
            self.pages.push((column_id, sealed.to_vec()));
            Ok(locator)
        }

        fn commit_cluster(&mut self, _n_entries: ClusterSize) -> NTupleResult<Locator> {
            self.clusters += 1;
            Ok(Locator::default())
        }

        fn commit_dataset(&mut self, descriptor: &NTupleDescriptor) -> NTupleResult<()> {
            self.committed = Some(descriptor.clone());
            Ok(())
        }
    }

    fn model() -> NTupleModel {
        NTupleModel::new()
            .with_field(Field::leaf("pt", "float", ColumnType::Real32))
            .with_field(Field::collection(
                "jets",
                "std::vector<float>",
                Field::leaf("jet", "float", ColumnType::Real32),
            ))
    }

    fn sink() -> PageSink<RecordingBackend> {
        PageSink::new(
            "events",
            RecordingBackend::default(),
            WriteOptions::default().with_compression(CompressionSettings::UNCOMPRESSED),
        )
    }

    #[test]
    fn create_assigns_ids_depth_first() {
        let mut sink = sink();
        let handles = sink.create(&model()).unwrap();
        assert!(sink.backend().created);
        assert_eq!(
            handles.iter().map(ColumnHandle::id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let desc = sink.descriptor();
        assert_eq!(desc.name(), "events");
        assert_eq!(desc.n_fields(), 4);
        let pt = desc.find_field_id("pt").unwrap();
        let jets = desc.find_field_id("jets").unwrap();
        let item = desc.find_field_id_in("_0", jets).unwrap();
        assert_eq!((pt, jets, item), (1, 2, 3));
        assert_eq!(desc.find_column_id(jets, 0), Some(1));
        assert_eq!(desc.find_column_id(item, 0), Some(2));
        assert!(sink.create(&model()).is_err());
    }

    #[test]
    fn pages_accumulate_into_clusters() {
        let mut sink = sink();
        let handles = sink.create(&model()).unwrap();
        let pt = handles[0];

        for values in [[1.0f32, 2.0].as_slice(), &[3.0]] {
            let mut page = sink.reserve_page(&pt, 0).unwrap();
            assert_eq!(page.capacity(), 10_000);
            page.extend_from_slice(values).unwrap();
            sink.commit_page(&pt, &page).unwrap();
        }
        sink.commit_cluster(3).unwrap();

        let mut page = sink.reserve_page(&pt, 4).unwrap();
        page.push(4.0f32).unwrap();
        sink.commit_page(&pt, &page).unwrap();
        sink.commit_cluster(1).unwrap();
        sink.commit_dataset().unwrap();

        let desc = sink.into_backend().committed.unwrap();
        assert_eq!(desc.n_entries(), 4);
        assert_eq!(desc.n_elements(0), 4);
        let first = desc.cluster_descriptor(0).unwrap();
        assert_eq!(first.page_range(0).unwrap().n_pages(), 2);
        assert_eq!(first.page_range(0).unwrap().page_infos()[1].locator.position(), 8);
        let second = desc.cluster_descriptor(1).unwrap();
        assert_eq!(second.column_range(0).unwrap().first_element_index, 3);
        assert_eq!(second.entry_range(), 3..4);
        // columns without pages are recorded as empty
        assert!(second.page_range(2).unwrap().is_empty());
        assert_eq!(second.column_range(2).unwrap().n_elements, 0);
    }

    #[test]
    fn failed_write_records_nothing() {
        let mut sink = sink();
        let handles = sink.create(&model()).unwrap();
        let mut page = sink.reserve_page(&handles[0], 2).unwrap();
        page.push(1.0f32).unwrap();

        sink.backend.fail_writes = true;
        assert!(sink.commit_page(&handles[0], &page).is_err());
        sink.backend.fail_writes = false;
        sink.commit_cluster(0).unwrap();
        let cluster = sink.descriptor().cluster_descriptor(0).unwrap();
        assert_eq!(cluster.column_range(0).unwrap().n_elements, 0);
        assert!(cluster.page_range(0).unwrap().is_empty());
    }

    #[test]
    fn protocol_order_is_enforced() {
        let mut sink = sink();
        let page = PageMut::new(0, ColumnType::Real32, 1).unwrap();
        let handle = ColumnHandle::new(0, Column::new(ColumnType::Real32.into(), 0));
        assert!(sink.commit_page(&handle, &page).is_err());
        assert!(sink.commit_cluster(0).is_err());

        let handles = sink.create(&model()).unwrap();
        let mut page = sink.reserve_page(&handles[0], 1).unwrap();
        page.push(1.0f32).unwrap();
        sink.commit_page(&handles[0], &page).unwrap();
        assert!(sink.commit_dataset().is_err());

        sink.commit_cluster(1).unwrap();
        sink.commit_dataset().unwrap();
        assert!(matches!(
            sink.commit_page(&handles[0], &page),
            Err(ntuple_error::NTupleError::InvalidState(..))
        ));
        assert!(sink.commit_cluster(1).is_err());
        assert!(sink.commit_dataset().is_err());
    }

    #[test]
    fn add_column_resolves_existing_columns() {
        let mut sink = sink();
        sink.create(&model()).unwrap();
        let handle = sink
            .add_column(2, Column::new(ColumnType::Index.into(), 0))
            .unwrap();
        assert_eq!(handle.id(), 1);
        assert!(sink.add_column(2, Column::new(ColumnType::Index.into(), 1)).is_err());
        assert!(sink.add_column(2, Column::new(ColumnType::Real64.into(), 0)).is_err());
        assert_eq!(sink.storage_type(), PageStorageType::Sink);
    }

    #[test]
    fn compression_is_measured() {
        let mut sink = PageSink::new("zipped", RecordingBackend::default(), WriteOptions::default());
        let handles = sink.create(&model()).unwrap();
        let mut page = sink.reserve_page(&handles[0], 1000).unwrap();
        page.extend_from_slice(&[0.5f32; 1000]).unwrap();
        sink.commit_page(&handles[0], &page).unwrap();
        assert!(sink.backend().pages[0].1.len() < 4000);

        let mut counters = BTreeMap::new();
        sink.metrics().for_each_metric(|id, metric| {
            if let Metric::Counter(counter) = metric {
                counters.insert(id.name().to_string(), counter.count());
            }
        });
        assert_eq!(counters["n_page_committed"], 1);
        assert_eq!(counters["sz_zip"], 4000);
        assert!(counters["sz_write_payload"] < 4000);
    }
}
