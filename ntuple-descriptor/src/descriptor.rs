use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use itertools::Itertools;
use jiff::Timestamp;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::{
    ClusterDescriptor, ClusterSize, ColumnDescriptor, ColumnRange, DescriptorId, FieldDescriptor,
    INVALID_DESCRIPTOR_ID, NTupleSize, NTupleVersion,
};

/// The on-storage meta-data of an ntuple.
///
/// Represents the on-disk (on storage) information about an ntuple. The meta-data consists of a
/// header and one or several footers. The header carries the ntuple schema, i.e. the fields and
/// the associated columns and their relationships. The footer(s) carry information about one or
/// several clusters. For every cluster, a footer stores its location and size, and for every
/// column the range of element indexes as well as a description of the pages.
///
/// A descriptor may hold only a subset of all clusters, e.g. while a chain of files is being
/// followed. All aggregate queries reflect the clusters that are currently held.
#[derive(Debug, Clone, Default)]
pub struct NTupleDescriptor {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) author: String,
    pub(crate) custodian: String,
    pub(crate) time_stamp_data: Timestamp,
    pub(crate) time_stamp_written: Timestamp,
    pub(crate) version: NTupleVersion,
    pub(crate) own_uuid: Uuid,
    pub(crate) group_uuid: Uuid,

    pub(crate) fields: BTreeMap<DescriptorId, FieldDescriptor>,
    pub(crate) columns: BTreeMap<DescriptorId, ColumnDescriptor>,
    pub(crate) clusters: BTreeMap<DescriptorId, ClusterDescriptor>,

    // Lookup tables derived from the maps above, maintained by the builder.
    column_index: FxHashMap<(DescriptorId, u32), DescriptorId>,
    element_spans: FxHashMap<DescriptorId, Vec<ElementSpan>>,
    entry_index: BTreeSet<(NTupleSize, DescriptorId)>,
}

/// The non-empty global element window of one column in one cluster.
#[derive(Debug, Clone, Copy)]
struct ElementSpan {
    first: NTupleSize,
    end: NTupleSize,
    cluster_id: DescriptorId,
}

impl PartialEq for NTupleDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.author == other.author
            && self.custodian == other.custodian
            && self.time_stamp_data == other.time_stamp_data
            && self.time_stamp_written == other.time_stamp_written
            && self.version == other.version
            && self.own_uuid == other.own_uuid
            && self.group_uuid == other.group_uuid
            && self.fields == other.fields
            && self.columns == other.columns
            && self.clusters == other.clusters
    }
}

impl Eq for NTupleDescriptor {}

impl NTupleDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn custodian(&self) -> &str {
        &self.custodian
    }

    pub fn time_stamp_data(&self) -> Timestamp {
        self.time_stamp_data
    }

    pub fn time_stamp_written(&self) -> Timestamp {
        self.time_stamp_written
    }

    pub fn version(&self) -> NTupleVersion {
        self.version
    }

    pub fn own_uuid(&self) -> Uuid {
        self.own_uuid
    }

    pub fn group_uuid(&self) -> Uuid {
        self.group_uuid
    }

    pub fn field_descriptor(&self, field_id: DescriptorId) -> Option<&FieldDescriptor> {
        self.fields.get(&field_id)
    }

    pub fn column_descriptor(&self, column_id: DescriptorId) -> Option<&ColumnDescriptor> {
        self.columns.get(&column_id)
    }

    pub fn cluster_descriptor(&self, cluster_id: DescriptorId) -> Option<&ClusterDescriptor> {
        self.clusters.get(&cluster_id)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> + '_ {
        self.fields.values()
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> + '_ {
        self.columns.values()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterDescriptor> + '_ {
        self.clusters.values()
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn n_clusters(&self) -> usize {
        self.clusters.len()
    }

    /// The number of entries covered by the clusters currently held.
    pub fn n_entries(&self) -> NTupleSize {
        self.clusters
            .values()
            .map(|c| c.entry_range().end)
            .max()
            .unwrap_or(0)
    }

    /// The number of elements of a column covered by the clusters currently held.
    pub fn n_elements(&self, column_id: DescriptorId) -> NTupleSize {
        self.clusters
            .values()
            .filter_map(|c| c.column_range(column_id))
            .map(ColumnRange::end)
            .max()
            .unwrap_or(0)
    }

    /// The id of the field without a parent, i.e. the top-level record.
    pub fn root_field_id(&self) -> Option<DescriptorId> {
        self.find_field_id_in("", INVALID_DESCRIPTOR_ID)
    }

    /// Resolve one path segment: the child of `parent_id` called `field_name`.
    ///
    /// With `parent_id == INVALID_DESCRIPTOR_ID` the search is among parentless fields.
    pub fn find_field_id_in(&self, field_name: &str, parent_id: DescriptorId) -> Option<DescriptorId> {
        if parent_id == INVALID_DESCRIPTOR_ID {
            return self
                .fields
                .values()
                .find(|f| f.parent_id.is_none() && f.name == field_name)
                .map(|f| f.id);
        }
        self.fields
            .get(&parent_id)?
            .link_ids
            .iter()
            .copied()
            .find(|id| self.fields.get(id).is_some_and(|f| f.name == field_name))
    }

    /// Resolve a top-level field by name.
    pub fn find_field_id(&self, field_name: &str) -> Option<DescriptorId> {
        self.find_field_id_in(field_name, self.root_field_id()?)
    }

    /// Resolve a dot-separated path of field names starting below the root, e.g. `jets._0`.
    pub fn find_field_path(&self, path: &str) -> Option<DescriptorId> {
        path.split('.')
            .try_fold(self.root_field_id()?, |parent, name| {
                self.find_field_id_in(name, parent)
            })
    }

    /// The id of the `column_index`-th column of a field.
    pub fn find_column_id(&self, field_id: DescriptorId, column_index: u32) -> Option<DescriptorId> {
        self.column_index.get(&(field_id, column_index)).copied()
    }

    /// The cluster whose range for `column_id` contains the global element `index`.
    pub fn find_cluster_id(&self, column_id: DescriptorId, index: NTupleSize) -> Option<DescriptorId> {
        let spans = self.element_spans.get(&column_id)?;
        let idx = spans.partition_point(|s| s.end <= index);
        spans
            .get(idx)
            .filter(|s| s.first <= index)
            .map(|s| s.cluster_id)
    }

    /// The cluster whose entry window contains `entry`.
    pub fn find_cluster_id_by_entry(&self, entry: NTupleSize) -> Option<DescriptorId> {
        self.entry_index
            .range(..=(entry, DescriptorId::MAX))
            .rev()
            .map(|&(_, id)| id)
            .find(|id| {
                self.clusters
                    .get(id)
                    .is_some_and(|c| c.entry_range().contains(&entry))
            })
    }

    /// The cluster whose entry window starts where the given cluster's window ends.
    pub fn find_next_cluster_id(&self, cluster_id: DescriptorId) -> Option<DescriptorId> {
        let next_entry = self.clusters.get(&cluster_id)?.entry_range().end;
        self.entry_index
            .range((next_entry, 0)..=(next_entry, DescriptorId::MAX))
            .map(|&(_, id)| id)
            .find(|&id| id != cluster_id)
    }

    /// The cluster whose entry window ends where the given cluster's window starts.
    pub fn find_prev_cluster_id(&self, cluster_id: DescriptorId) -> Option<DescriptorId> {
        let first_entry = self.clusters.get(&cluster_id)?.first_entry_index;
        self.entry_index
            .range(..(first_entry, 0))
            .rev()
            .map(|&(_, id)| id)
            .find(|id| {
                self.clusters
                    .get(id)
                    .is_some_and(|c| c.entry_range().end == first_entry)
            })
    }

    /// The columns of a field, ordered by their index within the field.
    pub fn field_columns(&self, field_id: DescriptorId) -> Vec<&ColumnDescriptor> {
        (0..)
            .map_while(|index| self.find_column_id(field_id, index))
            .filter_map(|id| self.columns.get(&id))
            .collect()
    }

    /// The children of a field in declaration order.
    pub fn field_children(&self, field_id: DescriptorId) -> impl Iterator<Item = &FieldDescriptor> + '_ {
        self.fields
            .get(&field_id)
            .map(|f| f.link_ids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.fields.get(id))
    }

    /// The dot-separated path of a field below the root.
    pub fn qualified_field_name(&self, field_id: DescriptorId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.fields.get(&field_id)?;
        while let Some(parent_id) = current.parent_id {
            names.push(current.name.as_str());
            current = self.fields.get(&parent_id)?;
        }
        Some(names.iter().rev().join("."))
    }

    pub(crate) fn index_column(&mut self, column: &ColumnDescriptor) {
        self.column_index
            .insert((column.field_id, column.index), column.id);
    }

    pub(crate) fn index_column_range(&mut self, cluster_id: DescriptorId, range: &ColumnRange) {
        if range.n_elements == 0 {
            return;
        }
        let spans = self.element_spans.entry(range.column_id).or_default();
        let pos = spans.partition_point(|s| s.first < range.first_element_index);
        spans.insert(
            pos,
            ElementSpan {
                first: range.first_element_index,
                end: range.end(),
                cluster_id,
            },
        );
    }

    pub(crate) fn index_cluster_entries(&mut self, cluster_id: DescriptorId, first_entry: NTupleSize) {
        self.entry_index.insert((first_entry, cluster_id));
    }

    /// True if a non-empty entry window `[first, first + n)` intersects one of the held clusters.
    pub(crate) fn overlaps_entries(&self, first: NTupleSize, n: ClusterSize) -> bool {
        if n == 0 {
            return false;
        }
        let end = first + NTupleSize::from(n);
        // windows of non-empty clusters are disjoint, so the last one starting before `end` is
        // the only candidate
        self.entry_index
            .range(..(end, 0))
            .rev()
            .filter_map(|(_, id)| self.clusters.get(id))
            .find(|c| c.n_entries > 0)
            .is_some_and(|c| c.entry_range().end > first)
    }

    /// True if a non-empty column range intersects an element window already recorded for the
    /// same column.
    pub(crate) fn overlaps_elements(&self, range: &ColumnRange) -> bool {
        if range.n_elements == 0 {
            return false;
        }
        let Some(spans) = self.element_spans.get(&range.column_id) else {
            return false;
        };
        let idx = spans.partition_point(|s| s.end <= range.first_element_index);
        spans.get(idx).is_some_and(|s| s.first < range.end())
    }

    /// The non-empty element windows of a column, ordered by their first element.
    pub(crate) fn element_windows(
        &self,
        column_id: DescriptorId,
    ) -> impl Iterator<Item = (NTupleSize, NTupleSize, DescriptorId)> + '_ {
        self.element_spans
            .get(&column_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|s| (s.first, s.end, s.cluster_id))
    }

    /// Cluster ids ordered by their first entry.
    pub(crate) fn clusters_by_entry(&self) -> impl Iterator<Item = DescriptorId> + '_ {
        self.entry_index.iter().map(|&(_, id)| id)
    }

    /// Write a human readable summary of the schema and the cluster layout.
    pub fn print_info(&self, out: &mut impl std::fmt::Write) -> std::fmt::Result {
        write!(out, "{self}")
    }
}

impl Display for NTupleDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "NTuple  : {}", self.name)?;
        if !self.description.is_empty() {
            writeln!(f, "Desc.   : {}", self.description)?;
        }
        writeln!(f, "Author  : {}", self.author)?;
        writeln!(f, "Version : {}", self.version)?;
        writeln!(f, "UUID    : {}", self.own_uuid)?;
        writeln!(
            f,
            "Entries : {}, fields: {}, columns: {}, clusters: {}",
            self.n_entries(),
            self.fields.len(),
            self.columns.len(),
            self.clusters.len()
        )?;
        for column in self.columns.values() {
            let name = self
                .qualified_field_name(column.field_id)
                .unwrap_or_default();
            writeln!(
                f,
                "  column {:>3} [{}#{}] {:<8} elements: {}",
                column.id,
                name,
                column.index,
                column.model.column_type().name(),
                self.n_elements(column.id)
            )?;
        }
        for cluster in self.clusters.values() {
            let range = cluster.entry_range();
            writeln!(
                f,
                "  cluster {:>3} entries {}..{} bytes on storage: {}",
                cluster.id,
                range.start,
                range.end,
                cluster.bytes_on_storage()
            )?;
        }
        Ok(())
    }
}
