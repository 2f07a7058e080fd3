use std::borrow::Cow;
use std::sync::Arc;

use log::{debug, warn};
use ntuple_descriptor::{
    ClusterIndex, ClusterSize, ColumnRange, DescriptorId, FieldDescriptor, FieldStructure,
    NTupleDescriptor, NTupleDescriptorBuilder, NTupleSize, NTupleVersion, PageRange,
};
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};
use ntuple_metrics::NTupleMetrics;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::{
    Column, ColumnHandle, Page, PageSource, PageStorage, PageStorageType, SourceBackend,
    TaskScheduler,
};

/// An id as it is known to one of the joined sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Origin {
    source: usize,
    id: DescriptorId,
}

/// Translation between the ids of the joined descriptor and those of the member sources.
#[derive(Default)]
struct FriendIds {
    columns: FxHashMap<DescriptorId, Origin>,
    columns_back: FxHashMap<Origin, DescriptorId>,
    /// Per joined cluster, the matching cluster of every source.
    clusters: Vec<Vec<DescriptorId>>,
    clusters_back: FxHashMap<Origin, DescriptorId>,
}

impl FriendIds {
    fn origin_column(&self, column_id: DescriptorId) -> NTupleResult<Origin> {
        self.columns
            .get(&column_id)
            .copied()
            .ok_or_else(|| ntuple_err!("unknown column {column_id}"))
    }

    fn origin_cluster(&self, cluster_id: DescriptorId, source: usize) -> NTupleResult<DescriptorId> {
        usize::try_from(cluster_id)
            .ok()
            .and_then(|idx| self.clusters.get(idx))
            .and_then(|members| members.get(source))
            .copied()
            .ok_or_else(|| ntuple_err!("unknown cluster {cluster_id}"))
    }
}

/// Joins several ntuples with the same number of entries side by side.
///
/// The joined descriptor has a record field per member, named after the member ntuple, holding
/// that member's fields. Field, column and cluster ids are assigned anew; pages are served by the
/// member sources and handed out under the joined ids. Members must split their entries into
/// clusters at the same boundaries, so that every joined cluster covers one cluster per member.
pub struct FriendsPageSource<B: SourceBackend> {
    name: String,
    sources: Vec<PageSource<B>>,
    descriptor: Option<NTupleDescriptor>,
    ids: FriendIds,
    /// The member's handle for every registered joined column.
    handles: FxHashMap<DescriptorId, ColumnHandle>,
    metrics: NTupleMetrics,
}

impl<B: SourceBackend> FriendsPageSource<B> {
    pub fn new(name: impl Into<String>, sources: Vec<PageSource<B>>) -> Self {
        let name = name.into();
        let metrics = NTupleMetrics::default_with_tags([
            ("storage", Cow::Borrowed("friends")),
            ("ntuple", Cow::Owned(name.clone())),
        ]);
        for source in &sources {
            metrics.observe(source.metrics().clone());
        }
        Self {
            name,
            sources,
            descriptor: None,
            ids: FriendIds::default(),
            handles: FxHashMap::default(),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> &[PageSource<B>] {
        &self.sources
    }

    /// The joined metadata, once attached.
    pub fn descriptor(&self) -> Option<&NTupleDescriptor> {
        self.descriptor.as_ref()
    }

    /// Attach every member that is not attached yet and build the joined descriptor.
    ///
    /// Fails without a descriptor if the members differ in their number of entries or in their
    /// cluster boundaries.
    pub fn attach(&mut self) -> NTupleResult<()> {
        if self.descriptor.is_some() {
            ntuple_bail!(InvalidState: "friends source '{}' is already attached", self.name);
        }
        for source in &mut self.sources {
            if source.descriptor().is_none() {
                source.attach()?;
            }
        }
        let members = self
            .sources
            .iter()
            .map(|s| s.descriptor().ok_or_else(|| ntuple_err!(InvalidState: "friend source is not attached")))
            .collect::<NTupleResult<Vec<_>>>()?;

        let (descriptor, ids) = join(&self.name, &members)
            .map_err(|err| err.with_context(format!("cannot join the friends of '{}'", self.name)))?;
        debug!(
            "joined {} ntuples into '{}' with {} entries in {} clusters",
            members.len(),
            self.name,
            descriptor.n_entries(),
            descriptor.n_clusters()
        );
        self.descriptor = Some(descriptor);
        self.ids = ids;
        Ok(())
    }

    /// Decompress cluster pages of every member on `scheduler`.
    pub fn set_task_scheduler(&self, scheduler: Arc<dyn TaskScheduler>) {
        for source in &self.sources {
            source.set_task_scheduler(Arc::clone(&scheduler));
        }
    }

    fn member(&self, handle: &ColumnHandle) -> NTupleResult<(usize, &PageSource<B>, &ColumnHandle)> {
        let column_id = handle.id();
        let origin = self.ids.origin_column(column_id)?;
        let (Some(source), Some(member_handle)) = (self.sources.get(origin.source), self.handles.get(&column_id))
        else {
            ntuple_bail!("column {column_id} is not registered with friends source '{}'", self.name);
        };
        Ok((origin.source, source, member_handle))
    }

    /// Put a member's page under the joined ids.
    fn joined_page(&self, source: usize, column_id: DescriptorId, page: Page) -> NTupleResult<Page> {
        let origin = Origin {
            source,
            id: page.cluster_info().id(),
        };
        match self.ids.clusters_back.get(&origin) {
            Some(&cluster_id) => Ok(page.with_ids(column_id, cluster_id)),
            None => {
                if let Some(member) = self.sources.get(source) {
                    member.release_page(page);
                }
                Err(ntuple_err!(InvalidState: "cluster {} of friend {source} is not joined", origin.id))
            }
        }
    }

    /// The page holding the element at a global index of the column.
    pub fn populate_page(&self, handle: &ColumnHandle, global_index: NTupleSize) -> NTupleResult<Page> {
        let (source, member, member_handle) = self.member(handle)?;
        let page = member.populate_page(member_handle, global_index)?;
        self.joined_page(source, handle.id(), page)
    }

    /// The page holding the element at a cluster-relative index of the column.
    pub fn populate_page_in_cluster(&self, handle: &ColumnHandle, index: ClusterIndex) -> NTupleResult<Page> {
        let (source, member, member_handle) = self.member(handle)?;
        let cluster_id = self.ids.origin_cluster(index.cluster_id(), source)?;
        let page = member.populate_page_in_cluster(member_handle, ClusterIndex::new(cluster_id, index.index()))?;
        self.joined_page(source, handle.id(), page)
    }
}

impl<B: SourceBackend> PageStorage for FriendsPageSource<B> {
    fn storage_type(&self) -> PageStorageType {
        PageStorageType::Source
    }

    fn add_column(&mut self, field_id: DescriptorId, column: Column) -> NTupleResult<ColumnHandle> {
        let Some(descriptor) = &self.descriptor else {
            ntuple_bail!(InvalidState: "friends source '{}' is not attached", self.name);
        };
        let Some(column_id) = descriptor.find_column_id(field_id, column.index()) else {
            ntuple_bail!("field {field_id} has no column {}", column.index());
        };
        let origin = self.ids.origin_column(column_id)?;
        let Some(source) = self.sources.get_mut(origin.source) else {
            ntuple_bail!("column {column_id} belongs to unknown friend {}", origin.source);
        };
        let Some(origin_field) = source
            .descriptor()
            .and_then(|d| d.column_descriptor(origin.id))
            .map(|c| c.field_id())
        else {
            ntuple_bail!("friend {} has no column {}", origin.source, origin.id);
        };
        let member_handle = source.add_column(origin_field, column)?;
        self.handles.insert(column_id, member_handle);
        Ok(ColumnHandle::new(column_id, column))
    }

    fn drop_column(&mut self, handle: &ColumnHandle) {
        let Some(member_handle) = self.handles.remove(&handle.id()) else {
            return;
        };
        if let Some(source) = self
            .ids
            .columns
            .get(&handle.id())
            .and_then(|origin| self.sources.get_mut(origin.source))
        {
            source.drop_column(&member_handle);
        }
    }

    fn release_page(&self, page: Page) {
        let column_id = page.column_id();
        let cluster_id = page.cluster_info().id();
        let origin = match self.ids.origin_column(column_id) {
            Ok(origin) => origin,
            Err(err) => {
                warn!("cannot release page: {err}");
                return;
            }
        };
        match (
            self.sources.get(origin.source),
            self.ids.origin_cluster(cluster_id, origin.source),
        ) {
            (Some(source), Ok(origin_cluster)) => {
                source.release_page(page.with_ids(origin.id, origin_cluster));
            }
            _ => warn!("cannot release page of column {column_id} in unknown cluster {cluster_id}"),
        }
    }

    fn metrics(&self) -> &NTupleMetrics {
        &self.metrics
    }
}

/// Build the joined descriptor of `members` and the id translation.
fn join(name: &str, members: &[&NTupleDescriptor]) -> NTupleResult<(NTupleDescriptor, FriendIds)> {
    if let Some((first, rest)) = members.split_first() {
        for other in rest {
            if other.n_entries() != first.n_entries() {
                ntuple_bail!(
                    Schema: "mismatch in the number of entries: '{}' has {}, '{}' has {}",
                    first.name(),
                    first.n_entries(),
                    other.name(),
                    other.n_entries()
                );
            }
        }
    }

    let mut joiner = Joiner {
        builder: NTupleDescriptorBuilder::new(),
        ids: FriendIds::default(),
        next_field_id: 1,
        next_column_id: 0,
    };
    joiner
        .builder
        .set_ntuple(name, "", "", NTupleVersion::default(), Uuid::nil())?;
    joiner
        .builder
        .add_field(FieldDescriptor::new(0, "", "", FieldStructure::Record))?;

    for (source, member) in members.iter().enumerate() {
        let Some(root_id) = member.root_field_id() else {
            ntuple_bail!(Schema: "friend '{}' has no root field", member.name());
        };
        joiner.add_field_tree(member, source, root_id, 0, Some(member.name()))?;
    }
    joiner.add_clusters(members)?;
    joiner.builder.ensure_valid()?;
    Ok((joiner.builder.move_descriptor(), joiner.ids))
}

struct Joiner {
    builder: NTupleDescriptorBuilder,
    ids: FriendIds,
    next_field_id: DescriptorId,
    next_column_id: DescriptorId,
}

impl Joiner {
    /// Copy a member's field, its columns and its subtree below `parent_id`.
    fn add_field_tree(
        &mut self,
        member: &NTupleDescriptor,
        source: usize,
        field_id: DescriptorId,
        parent_id: DescriptorId,
        rename: Option<&str>,
    ) -> NTupleResult<()> {
        let Some(field) = member.field_descriptor(field_id) else {
            ntuple_bail!(Schema: "friend '{}' has no field {field_id}", member.name());
        };
        let joined_id = self.next_field_id;
        self.next_field_id += 1;
        self.builder.add_field(
            FieldDescriptor::new(
                joined_id,
                rename.unwrap_or(field.name()),
                field.type_name(),
                field.structure(),
            )
            .with_description(field.description())
            .with_n_repetitions(field.n_repetitions())
            .with_field_version(field.field_version())
            .with_type_version(field.type_version()),
        )?;
        self.builder.add_field_link(parent_id, joined_id)?;

        for column in member.field_columns(field_id) {
            let column_id = self.next_column_id;
            self.next_column_id += 1;
            self.builder
                .add_column(column_id, joined_id, column.version(), column.model(), column.index())?;
            let origin = Origin {
                source,
                id: column.id(),
            };
            self.ids.columns.insert(column_id, origin);
            self.ids.columns_back.insert(origin, column_id);
        }

        let children = member.field_children(field_id).map(FieldDescriptor::id).collect::<Vec<_>>();
        for child in children {
            self.add_field_tree(member, source, child, joined_id, None)?;
        }
        Ok(())
    }

    fn add_clusters(&mut self, members: &[&NTupleDescriptor]) -> NTupleResult<()> {
        let by_entry = members
            .iter()
            .map(|member| {
                let mut clusters = member
                    .clusters()
                    .map(|c| (c.first_entry_index(), c.n_entries(), c.id()))
                    .collect::<Vec<_>>();
                clusters.sort_unstable();
                clusters
            })
            .collect::<Vec<_>>();
        let Some((first, rest)) = by_entry.split_first() else {
            return Ok(());
        };
        for (source, clusters) in rest.iter().enumerate() {
            let same_boundaries = clusters.len() == first.len()
                && clusters
                    .iter()
                    .zip(first)
                    .all(|(a, b)| (a.0, a.1) == (b.0, b.1));
            if !same_boundaries {
                ntuple_bail!(
                    Schema: "friend '{}' splits its entries into clusters differently than '{}'",
                    members.get(source + 1).map(|m| m.name()).unwrap_or_default(),
                    members.first().map(|m| m.name()).unwrap_or_default()
                );
            }
        }

        for (idx, &(first_entry, n_entries, _)) in first.iter().enumerate() {
            let cluster_id = DescriptorId::try_from(idx)?;
            self.builder
                .add_cluster(cluster_id, NTupleVersion::default(), first_entry, n_entries)?;
            let mut origins = Vec::with_capacity(members.len());
            for (source, (member, clusters)) in members.iter().zip(&by_entry).enumerate() {
                let Some(&(_, _, origin_id)) = clusters.get(idx) else {
                    ntuple_bail!("friend '{}' has no cluster {idx}", member.name());
                };
                self.add_member_cluster(member, source, origin_id, cluster_id, n_entries)?;
                origins.push(origin_id);
                self.ids.clusters_back.insert(
                    Origin {
                        source,
                        id: origin_id,
                    },
                    cluster_id,
                );
            }
            self.ids.clusters.push(origins);
        }
        Ok(())
    }

    fn add_member_cluster(
        &mut self,
        member: &NTupleDescriptor,
        source: usize,
        origin_id: DescriptorId,
        cluster_id: DescriptorId,
        n_entries: ClusterSize,
    ) -> NTupleResult<()> {
        let Some(cluster) = member.cluster_descriptor(origin_id) else {
            ntuple_bail!("friend '{}' has no cluster {origin_id}", member.name());
        };
        debug!(
            "joining cluster {origin_id} of '{}' with {n_entries} entries as cluster {cluster_id}",
            member.name()
        );
        for range in cluster.column_ranges() {
            let Some(&column_id) = self.ids.columns_back.get(&Origin {
                source,
                id: range.column_id,
            }) else {
                ntuple_bail!(Schema: "cluster {origin_id} of '{}' has unknown column {}", member.name(), range.column_id);
            };
            self.builder.add_cluster_column_range(
                cluster_id,
                ColumnRange::new(
                    column_id,
                    range.first_element_index,
                    range.n_elements,
                    range.compression_settings,
                ),
            )?;
            let pages = cluster
                .page_range(range.column_id)
                .map(|pages| pages.page_infos().to_vec())
                .unwrap_or_default();
            self.builder
                .add_cluster_page_range(cluster_id, PageRange::from_pages(column_id, pages))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ntuple_descriptor::{ColumnType, Field, NTupleModel};
    use ntuple_error::NTupleError;
    use ntuple_metrics::Metric;

    use super::*;
    use crate::{FileSinkBackend, FileSourceBackend, PageSink, ReadOptions, WriteOptions};

    /// A container with one `double` field whose value at entry `i` is `i * factor`.
    fn container(name: &str, field: &str, factor: f64, clusters: &[u32]) -> Bytes {
        let model = NTupleModel::new().with_field(Field::leaf(field, "double", ColumnType::Real64));
        let mut sink = PageSink::new(name, FileSinkBackend::new(Vec::new()), WriteOptions::default());
        let handles = sink.create(&model).unwrap();
        let mut next = 0u32;
        for &n in clusters {
            let mut page = sink.reserve_page(&handles[0], usize::try_from(n).unwrap()).unwrap();
            let values = (next..next + n)
                .map(|v| f64::from(v) * factor)
                .collect::<Vec<_>>();
            page.extend_from_slice(&values).unwrap();
            sink.commit_page(&handles[0], &page).unwrap();
            sink.commit_cluster(n).unwrap();
            next += n;
        }
        sink.commit_dataset().unwrap();
        Bytes::from(sink.into_backend().into_inner())
    }

    fn source(container: Bytes) -> PageSource<FileSourceBackend<Bytes>> {
        PageSource::new(FileSourceBackend::new(container), ReadOptions::default())
    }

    fn friends(calib_clusters: &[u32]) -> FriendsPageSource<FileSourceBackend<Bytes>> {
        FriendsPageSource::new(
            "joined",
            vec![
                source(container("events", "pt", 1.0, &[30, 20])),
                source(container("calib", "scale", 2.0, calib_clusters)),
            ],
        )
    }

    #[test]
    fn friends_are_joined_side_by_side() {
        let mut friends = friends(&[30, 20]);
        friends.attach().unwrap();
        assert!(matches!(friends.attach(), Err(NTupleError::InvalidState(..))));

        let (pt, scale) = {
            let desc = friends.descriptor().unwrap();
            assert_eq!(desc.name(), "joined");
            assert_eq!(desc.n_entries(), 50);
            assert_eq!(desc.n_clusters(), 2);
            (
                desc.find_field_path("events.pt").unwrap(),
                desc.find_field_path("calib.scale").unwrap(),
            )
        };
        let column = Column::new(ColumnType::Real64.into(), 0);
        let pt = friends.add_column(pt, column).unwrap();
        let scale = friends.add_column(scale, column).unwrap();
        assert_ne!(pt.id(), scale.id());

        let page = friends.populate_page(&scale, 42).unwrap();
        assert_eq!(page.column_id(), scale.id());
        assert_eq!(page.cluster_info().id(), 1);
        assert!((page.get::<f64>(42).unwrap() - 84.0).abs() < f64::EPSILON);
        friends.release_page(page);

        let index = ClusterIndex::new(1, 5);
        let page = friends.populate_page_in_cluster(&pt, index).unwrap();
        assert_eq!(page.column_id(), pt.id());
        assert!((page.get_in_cluster::<f64>(index).unwrap() - 35.0).abs() < f64::EPSILON);
        friends.release_page(page);

        // released pages find their way back to the member pools
        assert!(friends.sources().iter().all(|s| s.n_pooled_pages() == 0));

        friends.drop_column(&scale);
        assert!(friends.populate_page(&scale, 0).is_err());
    }

    #[test]
    fn member_metrics_are_observed() {
        let mut friends = friends(&[30, 20]);
        friends.attach().unwrap();
        let field = friends
            .descriptor()
            .and_then(|d| d.find_field_path("calib.scale"))
            .unwrap();
        let scale = friends
            .add_column(field, Column::new(ColumnType::Real64.into(), 0))
            .unwrap();
        for entry in [0, 35] {
            let page = friends.populate_page(&scale, entry).unwrap();
            friends.release_page(page);
        }

        let mut populated = 0;
        friends.metrics().for_each_metric(|id, metric| {
            if let Metric::Counter(counter) = metric {
                if id.name() == "n_page_populated" {
                    populated += counter.count();
                }
            }
        });
        assert_eq!(populated, 2);
    }

    #[test]
    fn friends_must_agree_on_entries() {
        let mut friends = friends(&[30, 21]);
        let err = friends.attach().unwrap_err();
        assert!(err.is_schema());
        assert!(friends.descriptor().is_none());
    }

    #[test]
    fn friends_must_agree_on_cluster_boundaries() {
        let mut friends = friends(&[25, 25]);
        let err = friends.attach().unwrap_err();
        assert!(err.is_schema());
        assert!(err.to_string().contains("cannot join the friends of 'joined'"));
    }
}
