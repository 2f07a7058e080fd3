use crate::{ColumnModel, DescriptorId, NTupleVersion};

/// Meta-data stored for every column of the ntuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub(crate) id: DescriptorId,
    pub(crate) version: NTupleVersion,
    pub(crate) model: ColumnModel,
    pub(crate) field_id: DescriptorId,
    pub(crate) index: u32,
}

impl ColumnDescriptor {
    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn version(&self) -> NTupleVersion {
        self.version
    }

    pub fn model(&self) -> ColumnModel {
        self.model
    }

    /// The field this column belongs to.
    pub fn field_id(&self) -> DescriptorId {
        self.field_id
    }

    /// A field can be serialized into several columns; this is the column's position among them.
    pub fn index(&self) -> u32 {
        self.index
    }
}
