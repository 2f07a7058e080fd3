use std::fmt::{Display, Formatter};

use ntuple_descriptor::{ColumnModel, DescriptorId, INVALID_DESCRIPTOR_ID, NTupleVersion};
use ntuple_error::NTupleResult;
use ntuple_metrics::NTupleMetrics;

use crate::Page;

/// The direction of a [`PageStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageStorageType {
    Sink,
    Source,
}

impl Display for PageStorageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PageStorageType::Sink => write!(f, "sink"),
            PageStorageType::Source => write!(f, "source"),
        }
    }
}

/// The static description of a column as seen by the page storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Column {
    model: ColumnModel,
    index: u32,
    version: NTupleVersion,
}

impl Column {
    pub fn new(model: ColumnModel, index: u32) -> Self {
        Self {
            model,
            index,
            version: NTupleVersion::default(),
        }
    }

    pub fn with_version(mut self, version: NTupleVersion) -> Self {
        self.version = version;
        self
    }

    pub fn model(&self) -> ColumnModel {
        self.model
    }

    /// Position of the column within its field.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn version(&self) -> NTupleVersion {
        self.version
    }
}

/// Identifies a column registered with a page storage in subsequent page operations.
///
/// The default handle refers to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnHandle {
    id: DescriptorId,
    column: Option<Column>,
}

impl Default for ColumnHandle {
    fn default() -> Self {
        Self {
            id: INVALID_DESCRIPTOR_ID,
            column: None,
        }
    }
}

impl ColumnHandle {
    pub fn new(id: DescriptorId, column: Column) -> Self {
        Self {
            id,
            column: Some(column),
        }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn column(&self) -> Option<&Column> {
        self.column.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.id != INVALID_DESCRIPTOR_ID || self.column.is_some()
    }
}

/// The contract shared by [`PageSink`](crate::PageSink) and [`PageSource`](crate::PageSource).
///
/// Pages are owned by the storage that produced them; callers hand them back with
/// [`release_page`](Self::release_page) instead of dropping them.
pub trait PageStorage {
    fn storage_type(&self) -> PageStorageType;

    /// Register interest in the `column.index()`-th column of a field.
    fn add_column(&mut self, field_id: DescriptorId, column: Column) -> NTupleResult<ColumnHandle>;

    fn drop_column(&mut self, handle: &ColumnHandle);

    fn release_page(&self, page: Page);

    fn metrics(&self) -> &NTupleMetrics;
}

#[cfg(test)]
mod tests {
    use ntuple_descriptor::ColumnType;

    use super::*;

    #[test]
    fn default_handle_is_invalid() {
        let handle = ColumnHandle::default();
        assert!(!handle.is_valid());
        assert!(handle.column().is_none());

        let handle = ColumnHandle::new(3, Column::new(ColumnType::Real32.into(), 0));
        assert!(handle.is_valid());
        assert_eq!(handle.id(), 3);
        assert_eq!(
            handle.column().map(|c| c.model().column_type()),
            Some(ColumnType::Real32)
        );
    }
}
