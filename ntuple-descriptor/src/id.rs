use std::fmt::{Display, Formatter};

/// Identifier of a field, column or cluster, unique within its kind.
pub type DescriptorId = u64;

/// Sentinel denoting "no id", e.g. the parent of the root field.
pub const INVALID_DESCRIPTOR_ID: DescriptorId = u64::MAX;

/// Number of entries in a cluster, or of elements of a column within a cluster.
pub type ClusterSize = u32;

/// A global entry or element index.
pub type NTupleSize = u64;

/// Version information attached to an ntuple, a field, a field's type, a column or a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NTupleVersion {
    version_use: u32,
    version_min: u32,
    flags: u64,
}

impl NTupleVersion {
    pub const fn new(version_use: u32, version_min: u32, flags: u64) -> Self {
        Self {
            version_use,
            version_min,
            flags,
        }
    }

    /// The version that was used to produce the data.
    pub fn version_use(&self) -> u32 {
        self.version_use
    }

    /// The minimum version required to interpret the data.
    pub fn version_min(&self) -> u32 {
        self.version_min
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }
}

impl Display for NTupleVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.version_use, self.version_min)?;
        if self.flags != 0 {
            write!(f, " (flags {:#x})", self.flags)?;
        }
        Ok(())
    }
}

/// Addresses an element relative to the start of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterIndex {
    cluster_id: DescriptorId,
    index: ClusterSize,
}

impl ClusterIndex {
    pub fn new(cluster_id: DescriptorId, index: ClusterSize) -> Self {
        Self { cluster_id, index }
    }

    pub fn cluster_id(&self) -> DescriptorId {
        self.cluster_id
    }

    pub fn index(&self) -> ClusterSize {
        self.index
    }
}

impl Display for ClusterIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.cluster_id, self.index)
    }
}
