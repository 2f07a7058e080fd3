use std::fmt::{Display, Formatter};

use ntuple_error::{NTupleError, ntuple_err};

/// The trivial, native content types of a column.
///
/// More complex types, such as records and collections, are translated into columns of these
/// simple types by the field layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ColumnType {
    Unknown = 0,
    /// Root columns of (nested) collections; 32bit offsets that count relative to the current cluster.
    Index = 1,
    /// 64bit column whose lower 32bits are an [`Index`](ColumnType::Index) and the upper 32bits a dispatch tag.
    Switch = 2,
    Byte = 3,
    Bit = 4,
    Real64 = 5,
    Real32 = 6,
    Real16 = 7,
    Real8 = 8,
    Int64 = 9,
    Int32 = 10,
    Int16 = 11,
}

impl ColumnType {
    pub const ALL: [ColumnType; 12] = [
        ColumnType::Unknown,
        ColumnType::Index,
        ColumnType::Switch,
        ColumnType::Byte,
        ColumnType::Bit,
        ColumnType::Real64,
        ColumnType::Real32,
        ColumnType::Real16,
        ColumnType::Real8,
        ColumnType::Int64,
        ColumnType::Int32,
        ColumnType::Int16,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Unknown => "Unknown",
            ColumnType::Index => "Index",
            ColumnType::Switch => "Switch",
            ColumnType::Byte => "Byte",
            ColumnType::Bit => "Bit",
            ColumnType::Real64 => "Real64",
            ColumnType::Real32 => "Real32",
            ColumnType::Real16 => "Real16",
            ColumnType::Real8 => "Real8",
            ColumnType::Int64 => "Int64",
            ColumnType::Int32 => "Int32",
            ColumnType::Int16 => "Int16",
        }
    }

    /// Size of a single element on storage, in bits.
    pub fn bits_on_storage(&self) -> u32 {
        match self {
            ColumnType::Unknown => 0,
            ColumnType::Index => 32,
            ColumnType::Switch => 64,
            ColumnType::Byte => 8,
            // stored as one byte per element
            ColumnType::Bit => 8,
            ColumnType::Real64 => 64,
            ColumnType::Real32 => 32,
            ColumnType::Real16 => 16,
            ColumnType::Real8 => 8,
            ColumnType::Int64 => 64,
            ColumnType::Int32 => 32,
            ColumnType::Int16 => 16,
        }
    }

    /// Size of a single element on storage, in bytes.
    pub fn element_size(&self) -> usize {
        (self.bits_on_storage() / 8) as usize
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<ColumnType> for u16 {
    fn from(value: ColumnType) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for ColumnType {
    type Error = NTupleError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ColumnType::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| ntuple_err!(Format: "unknown column type {value}"))
    }
}

/// Holds the static meta-data of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnModel {
    column_type: ColumnType,
    is_sorted: bool,
}

impl ColumnModel {
    pub fn new(column_type: ColumnType, is_sorted: bool) -> Self {
        Self {
            column_type,
            is_sorted,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_sorted(&self) -> bool {
        self.is_sorted
    }
}

impl From<ColumnType> for ColumnModel {
    fn from(column_type: ColumnType) -> Self {
        Self::new(column_type, false)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for column_type in ColumnType::ALL {
            let wire = u16::from(column_type);
            assert_eq!(ColumnType::try_from(wire).unwrap(), column_type);
        }
        assert!(ColumnType::try_from(12).unwrap_err().is_format());
    }

    #[rstest]
    #[case(ColumnType::Index, 4)]
    #[case(ColumnType::Switch, 8)]
    #[case(ColumnType::Bit, 1)]
    #[case(ColumnType::Real32, 4)]
    #[case(ColumnType::Real16, 2)]
    #[case(ColumnType::Unknown, 0)]
    fn element_sizes(#[case] column_type: ColumnType, #[case] size: usize) {
        assert_eq!(column_type.element_size(), size);
    }
}
