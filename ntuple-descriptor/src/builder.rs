use std::mem;

use itertools::Itertools;
use jiff::Timestamp;
use log::debug;
use ntuple_error::{NTupleResult, ntuple_bail};
use uuid::Uuid;

use crate::serialize::{read_footer, read_header};
use crate::{
    ClusterDescriptor, ClusterSize, ColumnDescriptor, ColumnModel, ColumnRange, DescriptorId,
    FieldDescriptor, Locator, NTupleDescriptor, NTupleSize, NTupleVersion, PageRange,
};

/// The only way to construct or extend an [`NTupleDescriptor`].
///
/// Every call validates its input against the descriptor built so far and either applies the
/// change completely or fails without modifying anything. Ids are assigned by the caller.
#[derive(Debug, Default)]
pub struct NTupleDescriptorBuilder {
    descriptor: NTupleDescriptor,
    ntuple_set: bool,
}

impl NTupleDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(&self) -> &NTupleDescriptor {
        &self.descriptor
    }

    /// Take the built descriptor, leaving the builder empty.
    pub fn move_descriptor(&mut self) -> NTupleDescriptor {
        self.ntuple_set = false;
        mem::take(&mut self.descriptor)
    }

    /// Set the identity of the ntuple. Must be called once, before any field is added.
    pub fn set_ntuple(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        author: impl Into<String>,
        version: NTupleVersion,
        uuid: Uuid,
    ) -> NTupleResult<()> {
        if self.ntuple_set {
            ntuple_bail!(Schema: "ntuple identity is already set to '{}'", self.descriptor.name);
        }
        if !self.descriptor.fields.is_empty() {
            ntuple_bail!(Schema: "ntuple identity must be set before fields are added");
        }
        self.descriptor.name = name.into();
        self.descriptor.description = description.into();
        self.descriptor.author = author.into();
        self.descriptor.version = version;
        self.descriptor.own_uuid = uuid;
        self.ntuple_set = true;
        Ok(())
    }

    pub fn set_custodian(&mut self, custodian: impl Into<String>) {
        self.descriptor.custodian = custodian.into();
    }

    pub fn set_group_uuid(&mut self, group_uuid: Uuid) {
        self.descriptor.group_uuid = group_uuid;
    }

    /// Timestamps are stored with microsecond precision; finer parts are dropped.
    pub fn set_time_stamps(&mut self, data: Timestamp, written: Timestamp) {
        self.descriptor.time_stamp_data = truncate_to_micros(data);
        self.descriptor.time_stamp_written = truncate_to_micros(written);
    }

    /// Register a field. Any parent or children recorded in `field` are discarded; the tree is
    /// built with [`add_field_link`](Self::add_field_link).
    pub fn add_field(&mut self, mut field: FieldDescriptor) -> NTupleResult<()> {
        if self.descriptor.fields.contains_key(&field.id) {
            ntuple_bail!(Schema: "duplicate field id {}", field.id);
        }
        field.parent_id = None;
        field.link_ids.clear();
        self.descriptor.fields.insert(field.id, field);
        Ok(())
    }

    /// Append `child_id` to the children of `parent_id`.
    pub fn add_field_link(&mut self, parent_id: DescriptorId, child_id: DescriptorId) -> NTupleResult<()> {
        if parent_id == child_id {
            ntuple_bail!(Schema: "field {parent_id} cannot be linked to itself");
        }
        if !self.descriptor.fields.contains_key(&parent_id) {
            ntuple_bail!(Schema: "unknown parent field id {parent_id}");
        }
        let Some(child) = self.descriptor.fields.get(&child_id) else {
            ntuple_bail!(Schema: "unknown child field id {child_id}");
        };
        if let Some(existing) = child.parent_id {
            ntuple_bail!(Schema: "field {child_id} already has parent {existing}");
        }
        let mut ancestor = Some(parent_id);
        while let Some(id) = ancestor {
            if id == child_id {
                ntuple_bail!(Schema: "linking field {child_id} below {parent_id} creates a cycle");
            }
            ancestor = self.descriptor.fields.get(&id).and_then(|f| f.parent_id);
        }

        if let Some(child) = self.descriptor.fields.get_mut(&child_id) {
            child.parent_id = Some(parent_id);
        }
        if let Some(parent) = self.descriptor.fields.get_mut(&parent_id) {
            parent.link_ids.push(child_id);
        }
        Ok(())
    }

    /// Register the `index`-th column of a field. Columns of a field must be added in index order.
    pub fn add_column(
        &mut self,
        column_id: DescriptorId,
        field_id: DescriptorId,
        version: NTupleVersion,
        model: ColumnModel,
        index: u32,
    ) -> NTupleResult<()> {
        if self.descriptor.columns.contains_key(&column_id) {
            ntuple_bail!(Schema: "duplicate column id {column_id}");
        }
        if !self.descriptor.fields.contains_key(&field_id) {
            ntuple_bail!(Schema: "column {column_id} refers to unknown field {field_id}");
        }
        let expected = self.descriptor.field_columns(field_id).len();
        if index as usize != expected {
            ntuple_bail!(
                Schema: "column {column_id} has index {index} in field {field_id}, expected {expected}"
            );
        }
        let column = ColumnDescriptor {
            id: column_id,
            version,
            model,
            field_id,
            index,
        };
        self.descriptor.index_column(&column);
        self.descriptor.columns.insert(column_id, column);
        Ok(())
    }

    /// Open a cluster record covering the entries `[first_entry_index, first_entry_index + n_entries)`.
    pub fn add_cluster(
        &mut self,
        cluster_id: DescriptorId,
        version: NTupleVersion,
        first_entry_index: NTupleSize,
        n_entries: ClusterSize,
    ) -> NTupleResult<()> {
        if self.descriptor.clusters.contains_key(&cluster_id) {
            ntuple_bail!(Schema: "duplicate cluster id {cluster_id}");
        }
        if self.descriptor.overlaps_entries(first_entry_index, n_entries) {
            ntuple_bail!(
                Schema: "entries {first_entry_index}..{} of cluster {cluster_id} overlap another cluster",
                first_entry_index + NTupleSize::from(n_entries)
            );
        }
        self.descriptor.clusters.insert(
            cluster_id,
            ClusterDescriptor::new(cluster_id, version, first_entry_index, n_entries),
        );
        self.descriptor
            .index_cluster_entries(cluster_id, first_entry_index);
        Ok(())
    }

    pub fn set_cluster_locator(&mut self, cluster_id: DescriptorId, locator: Locator) -> NTupleResult<()> {
        let Some(cluster) = self.descriptor.clusters.get_mut(&cluster_id) else {
            ntuple_bail!(Schema: "unknown cluster id {cluster_id}");
        };
        cluster.locator = locator;
        Ok(())
    }

    pub fn add_cluster_column_range(
        &mut self,
        cluster_id: DescriptorId,
        range: ColumnRange,
    ) -> NTupleResult<()> {
        let column_id = range.column_id;
        let cluster = self.cluster_for_column(cluster_id, column_id)?;
        if cluster.column_ranges.contains_key(&column_id) {
            ntuple_bail!(Schema: "cluster {cluster_id} already has a column range for column {column_id}");
        }
        if let Some(pages) = cluster.page_ranges.get(&column_id) {
            check_page_sum(cluster_id, &range, pages)?;
        }
        if self.descriptor.overlaps_elements(&range) {
            ntuple_bail!(
                Schema: "elements {}..{} of column {column_id} in cluster {cluster_id} overlap another cluster",
                range.first_element_index,
                range.end()
            );
        }

        self.descriptor.index_column_range(cluster_id, &range);
        if let Some(cluster) = self.descriptor.clusters.get_mut(&cluster_id) {
            cluster.column_ranges.insert(column_id, range);
        }
        Ok(())
    }

    pub fn add_cluster_page_range(
        &mut self,
        cluster_id: DescriptorId,
        range: PageRange,
    ) -> NTupleResult<()> {
        let column_id = range.column_id;
        let cluster = self.cluster_for_column(cluster_id, column_id)?;
        if cluster.page_ranges.contains_key(&column_id) {
            ntuple_bail!(Schema: "cluster {cluster_id} already has a page range for column {column_id}");
        }
        if let Some(columns) = cluster.column_ranges.get(&column_id) {
            check_page_sum(cluster_id, columns, &range)?;
        }

        if let Some(cluster) = self.descriptor.clusters.get_mut(&cluster_id) {
            cluster.page_ranges.insert(column_id, range);
        }
        Ok(())
    }

    fn cluster_for_column(
        &self,
        cluster_id: DescriptorId,
        column_id: DescriptorId,
    ) -> NTupleResult<&ClusterDescriptor> {
        let Some(cluster) = self.descriptor.clusters.get(&cluster_id) else {
            ntuple_bail!(Schema: "unknown cluster id {cluster_id}");
        };
        if !self.descriptor.columns.contains_key(&column_id) {
            ntuple_bail!(Schema: "cluster {cluster_id} refers to unknown column {column_id}");
        }
        Ok(cluster)
    }

    /// Replace identity, fields and columns with the content of a serialized header.
    ///
    /// Fails, leaving the builder untouched, if the header is malformed or describes an
    /// inconsistent schema, or if clusters have already been added.
    pub fn set_from_header(&mut self, header: &[u8]) -> NTupleResult<()> {
        if !self.descriptor.clusters.is_empty() {
            ntuple_bail!(
                InvalidState: "cannot replace the schema of a descriptor holding {} clusters",
                self.descriptor.clusters.len()
            );
        }
        let contents = read_header(header)?;

        let mut staging = NTupleDescriptorBuilder::new();
        staging.set_ntuple(
            contents.name,
            contents.description,
            contents.author,
            contents.version,
            contents.own_uuid,
        )?;
        staging.set_custodian(contents.custodian);
        staging.set_group_uuid(contents.group_uuid);
        staging.set_time_stamps(contents.time_stamp_data, contents.time_stamp_written);

        let apply = |staging: &mut NTupleDescriptorBuilder| -> NTupleResult<()> {
            for field in &contents.fields {
                staging.add_field(field.clone())?;
            }
            for field in &contents.fields {
                for &child_id in &field.link_ids {
                    staging.add_field_link(field.id, child_id)?;
                }
            }
            for field in &contents.fields {
                let linked = staging
                    .descriptor
                    .fields
                    .get(&field.id)
                    .and_then(|f| f.parent_id);
                if linked != field.parent_id {
                    ntuple_bail!(
                        Schema: "field {} records parent {} but is linked below {}",
                        field.id,
                        field.parent_id.map_or_else(|| "none".to_string(), |id| id.to_string()),
                        linked.map_or_else(|| "none".to_string(), |id| id.to_string())
                    );
                }
            }
            for column in contents
                .columns
                .iter()
                .sorted_by_key(|c| (c.field_id, c.index))
            {
                staging.add_column(column.id, column.field_id, column.version, column.model, column.index)?;
            }
            Ok(())
        };
        apply(&mut staging).map_err(|e| e.with_context("inconsistent schema in header"))?;

        debug!(
            "read header of ntuple '{}': {} fields, {} columns",
            staging.descriptor.name,
            staging.descriptor.fields.len(),
            staging.descriptor.columns.len()
        );
        *self = staging;
        Ok(())
    }

    /// Add the clusters recorded in a serialized footer to those already held.
    ///
    /// The footer is applied completely or not at all.
    pub fn add_clusters_from_footer(&mut self, footer: &[u8]) -> NTupleResult<()> {
        let clusters = read_footer(footer)?;
        let n_clusters = clusters.len();

        let mut staging = NTupleDescriptorBuilder {
            descriptor: self.descriptor.clone(),
            ntuple_set: self.ntuple_set,
        };
        for cluster in clusters {
            let id = cluster.id;
            staging
                .insert_cluster(cluster)
                .map_err(|e| e.with_context(format!("inconsistent cluster {id} in footer")))?;
        }

        debug!(
            "read footer of ntuple '{}': {n_clusters} clusters, {} in total",
            staging.descriptor.name,
            staging.descriptor.clusters.len()
        );
        *self = staging;
        Ok(())
    }

    fn insert_cluster(&mut self, cluster: ClusterDescriptor) -> NTupleResult<()> {
        let ClusterDescriptor {
            id,
            version,
            first_entry_index,
            n_entries,
            locator,
            column_ranges,
            page_ranges,
        } = cluster;
        if !column_ranges.keys().eq(page_ranges.keys()) {
            ntuple_bail!(Schema: "cluster {id} records column ranges and page ranges for different columns");
        }
        self.add_cluster(id, version, first_entry_index, n_entries)?;
        self.set_cluster_locator(id, locator)?;
        for range in column_ranges.into_values() {
            self.add_cluster_column_range(id, range)?;
        }
        for range in page_ranges.into_values() {
            self.add_cluster_page_range(id, range)?;
        }
        Ok(())
    }

    /// Check the invariants that individual builder calls cannot enforce on their own.
    ///
    /// A descriptor with fields has a single root, every cluster records a page range for each of
    /// its column ranges, the held clusters tile a contiguous entry window and the element windows
    /// of every column are contiguous.
    pub fn ensure_valid(&self) -> NTupleResult<()> {
        let desc = &self.descriptor;
        if !desc.fields.is_empty() {
            let roots = desc
                .fields
                .values()
                .filter(|f| f.parent_id.is_none())
                .map(|f| f.id)
                .collect::<Vec<_>>();
            if roots.len() != 1 {
                ntuple_bail!(
                    Schema: "expected exactly one root field, found {}: [{}]",
                    roots.len(),
                    roots.iter().join(", ")
                );
            }
        }

        for cluster in desc.clusters.values() {
            for column_id in cluster.column_ranges.keys() {
                if !cluster.page_ranges.contains_key(column_id) {
                    ntuple_bail!(
                        Schema: "cluster {} has a column range but no page range for column {column_id}",
                        cluster.id
                    );
                }
            }
            for column_id in cluster.page_ranges.keys() {
                if !cluster.column_ranges.contains_key(column_id) {
                    ntuple_bail!(
                        Schema: "cluster {} has a page range but no column range for column {column_id}",
                        cluster.id
                    );
                }
            }
        }

        for (prev, next) in desc
            .clusters_by_entry()
            .filter_map(|id| desc.clusters.get(&id))
            .filter(|c| c.n_entries > 0)
            .tuple_windows()
        {
            if prev.entry_range().end != next.first_entry_index {
                ntuple_bail!(
                    Schema: "cluster {} ends at entry {} but the following cluster {} starts at {}",
                    prev.id,
                    prev.entry_range().end,
                    next.id,
                    next.first_entry_index
                );
            }
        }

        for column_id in desc.columns.keys() {
            for ((_, prev_end, prev_cluster), (next_first, _, next_cluster)) in
                desc.element_windows(*column_id).tuple_windows()
            {
                if prev_end != next_first {
                    ntuple_bail!(
                        Schema: "elements of column {column_id} end at {prev_end} in cluster {prev_cluster} \
                        but continue at {next_first} in cluster {next_cluster}"
                    );
                }
            }
        }
        Ok(())
    }
}

fn check_page_sum(cluster_id: DescriptorId, columns: &ColumnRange, pages: &PageRange) -> NTupleResult<()> {
    if pages.n_elements() != NTupleSize::from(columns.n_elements) {
        ntuple_bail!(
            Schema: "pages of column {} in cluster {cluster_id} hold {} elements, the column range {}",
            columns.column_id,
            pages.n_elements(),
            columns.n_elements
        );
    }
    Ok(())
}

fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    Timestamp::from_microsecond(ts.as_microsecond()).unwrap_or(ts)
}
