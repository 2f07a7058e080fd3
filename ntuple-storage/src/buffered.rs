use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;
use ntuple_descriptor::{ClusterSize, DescriptorId, NTupleDescriptor, NTupleModel, NTupleSize};
use ntuple_error::{NTupleError, NTupleResult, ntuple_bail, ntuple_err};
use ntuple_metrics::{NTupleMetrics, Stopwatch};
use parking_lot::Mutex;

use crate::{
    Column, ColumnHandle, InlineTaskScheduler, Page, PageMut, PageSink, PageStorage,
    PageStorageType, SealedPage, SinkBackend, TaskScheduler, WriteOptions,
};

struct BufferedPage {
    handle: ColumnHandle,
    n_elements: ClusterSize,
    packed: Bytes,
}

/// A page sink that holds back the pages of the open cluster and compresses them together.
///
/// Committed pages are copied into per-column buffers. Committing the cluster seals all of them
/// in parallel on the task scheduler and hands them to the wrapped [`PageSink`] column by column,
/// so the pages of a column end up next to each other on storage. Metrics are those of the wrapped
/// sink.
pub struct BufferedPageSink<B> {
    inner: PageSink<B>,
    scheduler: Arc<dyn TaskScheduler>,
    buffered: BTreeMap<DescriptorId, Vec<BufferedPage>>,
}

impl<B: SinkBackend> BufferedPageSink<B> {
    pub fn new(name: impl Into<String>, backend: B, options: WriteOptions) -> Self {
        Self::wrap(PageSink::new(name, backend, options))
    }

    pub fn wrap(inner: PageSink<B>) -> Self {
        Self {
            inner,
            scheduler: Arc::new(InlineTaskScheduler),
            buffered: BTreeMap::new(),
        }
    }

    /// Seal pages on `scheduler` instead of the committing thread.
    pub fn set_task_scheduler(&mut self, scheduler: Arc<dyn TaskScheduler>) {
        self.scheduler = scheduler;
    }

    pub fn descriptor(&self) -> &NTupleDescriptor {
        self.inner.descriptor()
    }

    pub fn n_entries(&self) -> NTupleSize {
        self.inner.n_entries()
    }

    /// Number of pages waiting for the cluster to be committed.
    pub fn n_buffered_pages(&self) -> usize {
        self.buffered.values().map(Vec::len).sum()
    }

    pub fn backend(&self) -> &B {
        self.inner.backend()
    }

    pub fn into_inner(self) -> PageSink<B> {
        self.inner
    }

    pub fn into_backend(self) -> B {
        self.inner.into_backend()
    }

    pub fn create(&mut self, model: &NTupleModel) -> NTupleResult<Vec<ColumnHandle>> {
        self.inner.create(model)
    }

    pub fn reserve_page(&self, handle: &ColumnHandle, n_elements: usize) -> NTupleResult<PageMut> {
        self.inner.reserve_page(handle, n_elements)
    }

    /// Keep a copy of the page until the cluster is committed. The page can be reused right away.
    pub fn commit_page(&mut self, handle: &ColumnHandle, page: &PageMut) -> NTupleResult<()> {
        self.inner.ensure_open("commit a page")?;
        if page.column_id() != handle.id() {
            ntuple_bail!(
                "page of column {} cannot be committed to column {}",
                page.column_id(),
                handle.id()
            );
        }
        if self.inner.descriptor().column_descriptor(handle.id()).is_none() {
            ntuple_bail!("cannot commit a page to unknown column {}", handle.id());
        }
        if page.is_empty() {
            return Ok(());
        }
        self.buffered
            .entry(handle.id())
            .or_default()
            .push(BufferedPage {
                handle: *handle,
                n_elements: ClusterSize::try_from(page.n_elements())?,
                packed: Bytes::copy_from_slice(page.as_bytes()),
            });
        Ok(())
    }

    /// Seal the buffered pages, write them and close the cluster.
    ///
    /// The buffers are emptied even if sealing fails.
    pub fn commit_cluster(&mut self, n_entries: ClusterSize) -> NTupleResult<()> {
        self.inner.ensure_open("commit a cluster")?;
        let pages = mem::take(&mut self.buffered)
            .into_values()
            .flatten()
            .collect::<Vec<_>>();
        let sealed = self.seal_all(&pages)?;
        debug!("sealed {} buffered pages", sealed.len());

        for (page, sealed) in pages.iter().zip(&sealed) {
            self.inner.commit_sealed_page(&page.handle, sealed)?;
        }
        self.inner.commit_cluster(n_entries)
    }

    fn seal_all(&self, pages: &[BufferedPage]) -> NTupleResult<Vec<SealedPage>> {
        let compression = self.inner.options().compression();
        let slots = Arc::new(Mutex::new(vec![None::<SealedPage>; pages.len()]));
        let first_error = Arc::new(Mutex::new(None::<NTupleError>));
        let watch = Stopwatch::start(self.inner.metrics().timer("time_wall_zip"));

        self.scheduler.reset();
        for (idx, page) in pages.iter().enumerate() {
            let column_id = page.handle.id();
            let n_elements = page.n_elements;
            let packed = page.packed.clone();
            let slots = Arc::clone(&slots);
            let first_error = Arc::clone(&first_error);
            self.scheduler.add_task(Box::new(move || {
                match SealedPage::seal(column_id, n_elements, packed, compression) {
                    Ok(sealed) => {
                        if let Some(slot) = slots.lock().get_mut(idx) {
                            *slot = Some(sealed);
                        }
                    }
                    Err(err) => {
                        first_error.lock().get_or_insert(err);
                    }
                }
            }));
        }
        self.scheduler.wait();
        watch.stop();

        if let Some(err) = first_error.lock().take() {
            return Err(err.with_context("cannot seal buffered pages"));
        }
        let sealed = mem::take(&mut *slots.lock());
        sealed
            .into_iter()
            .enumerate()
            .map(|(idx, page)| page.ok_or_else(|| ntuple_err!(InvalidState: "buffered page {idx} was not sealed")))
            .collect()
    }

    pub fn commit_dataset(&mut self) -> NTupleResult<()> {
        let n_buffered = self.n_buffered_pages();
        if n_buffered > 0 {
            ntuple_bail!(InvalidState: "{n_buffered} buffered pages are outside of a committed cluster");
        }
        self.inner.commit_dataset()
    }
}

impl<B: SinkBackend> PageStorage for BufferedPageSink<B> {
    fn storage_type(&self) -> PageStorageType {
        PageStorageType::Sink
    }

    fn add_column(&mut self, field_id: DescriptorId, column: Column) -> NTupleResult<ColumnHandle> {
        self.inner.add_column(field_id, column)
    }

    fn drop_column(&mut self, handle: &ColumnHandle) {
        self.inner.drop_column(handle);
    }

    fn release_page(&self, page: Page) {
        self.inner.release_page(page);
    }

    fn metrics(&self) -> &NTupleMetrics {
        self.inner.metrics()
    }
}
