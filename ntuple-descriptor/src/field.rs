use std::fmt::{Display, Formatter};

use ntuple_error::{NTupleError, ntuple_err};

use crate::{DescriptorId, NTupleVersion};

/// The structural role of a field in the schema tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FieldStructure {
    Leaf = 0,
    Collection = 1,
    Record = 2,
    Variant = 3,
    Reference = 4,
    Invalid = 5,
}

impl FieldStructure {
    pub fn name(&self) -> &'static str {
        match self {
            FieldStructure::Leaf => "Leaf",
            FieldStructure::Collection => "Collection",
            FieldStructure::Record => "Record",
            FieldStructure::Variant => "Variant",
            FieldStructure::Reference => "Reference",
            FieldStructure::Invalid => "Invalid",
        }
    }
}

impl Display for FieldStructure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<FieldStructure> for u16 {
    fn from(value: FieldStructure) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for FieldStructure {
    type Error = NTupleError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FieldStructure::Leaf,
            1 => FieldStructure::Collection,
            2 => FieldStructure::Record,
            3 => FieldStructure::Variant,
            4 => FieldStructure::Reference,
            5 => FieldStructure::Invalid,
            _ => return Err(ntuple_err!(Format: "unknown field structure {value}")),
        })
    }
}

/// Meta-data stored for every field of the ntuple.
///
/// The tree structure (parent and children) is established exclusively through
/// [`add_field_link`](crate::NTupleDescriptorBuilder::add_field_link); a freshly constructed
/// descriptor is dangling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub(crate) id: DescriptorId,
    pub(crate) field_version: NTupleVersion,
    pub(crate) type_version: NTupleVersion,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) type_name: String,
    pub(crate) n_repetitions: u64,
    pub(crate) structure: FieldStructure,
    pub(crate) parent_id: Option<DescriptorId>,
    pub(crate) link_ids: Vec<DescriptorId>,
}

impl FieldDescriptor {
    pub fn new(
        id: DescriptorId,
        name: impl Into<String>,
        type_name: impl Into<String>,
        structure: FieldStructure,
    ) -> Self {
        Self {
            id,
            field_version: NTupleVersion::default(),
            type_version: NTupleVersion::default(),
            name: name.into(),
            description: String::new(),
            type_name: type_name.into(),
            n_repetitions: 0,
            structure,
            parent_id: None,
            link_ids: Vec::new(),
        }
    }

    pub fn with_field_version(mut self, version: NTupleVersion) -> Self {
        self.field_version = version;
        self
    }

    pub fn with_type_version(mut self, version: NTupleVersion) -> Self {
        self.type_version = version;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Fixed-size arrays are leaves with a number of repetitions; zero means "not repeated".
    pub fn with_n_repetitions(mut self, n_repetitions: u64) -> Self {
        self.n_repetitions = n_repetitions;
        self
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn field_version(&self) -> NTupleVersion {
        self.field_version
    }

    pub fn type_version(&self) -> NTupleVersion {
        self.type_version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn n_repetitions(&self) -> u64 {
        self.n_repetitions
    }

    pub fn structure(&self) -> FieldStructure {
        self.structure
    }

    /// `None` for the root field.
    pub fn parent_id(&self) -> Option<DescriptorId> {
        self.parent_id
    }

    /// Child field ids in declaration order.
    pub fn link_ids(&self) -> &[DescriptorId] {
        &self.link_ids
    }
}
