use ntuple_descriptor::ColumnType;

/// A Rust type that can be stored as the elements of a column.
///
/// Elements are laid out back to back in little-endian byte order, [`SIZE`](Self::SIZE) bytes
/// each, which is the in-memory format of pages and their packed on-storage format.
pub trait ColumnElement: Copy + Send + Sync + 'static {
    const COLUMN_TYPE: ColumnType;
    const SIZE: usize;

    /// Encode into exactly [`SIZE`](Self::SIZE) bytes.
    fn write_le(self, out: &mut [u8]);

    /// Decode from exactly [`SIZE`](Self::SIZE) bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! numeric_element {
    ($t:ty, $column_type:expr) => {
        impl ColumnElement for $t {
            const COLUMN_TYPE: ColumnType = $column_type;
            const SIZE: usize = size_of::<$t>();

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut le = [0u8; size_of::<$t>()];
                le.copy_from_slice(bytes);
                <$t>::from_le_bytes(le)
            }
        }
    };
}

numeric_element!(f64, ColumnType::Real64);
numeric_element!(f32, ColumnType::Real32);
numeric_element!(i64, ColumnType::Int64);
numeric_element!(i32, ColumnType::Int32);
numeric_element!(i16, ColumnType::Int16);
numeric_element!(u8, ColumnType::Byte);
// cluster-relative collection offsets
numeric_element!(u32, ColumnType::Index);

impl ColumnElement for bool {
    const COLUMN_TYPE: ColumnType = ColumnType::Bit;
    const SIZE: usize = 1;

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// The element of a [`Switch`](ColumnType::Switch) column: an index into the items of the
/// selected alternative, and the tag of that alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SwitchValue {
    pub index: u32,
    pub tag: u32,
}

impl ColumnElement for SwitchValue {
    const COLUMN_TYPE: ColumnType = ColumnType::Switch;
    const SIZE: usize = 8;

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        let packed = u64::from(self.index) | (u64::from(self.tag) << 32);
        out.copy_from_slice(&packed.to_le_bytes());
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn read_le(bytes: &[u8]) -> Self {
        let mut le = [0u8; 8];
        le.copy_from_slice(bytes);
        let packed = u64::from_le_bytes(le);
        Self {
            index: packed as u32,
            tag: (packed >> 32) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn round_trip<T: ColumnElement + PartialEq + std::fmt::Debug>(value: T) {
        let mut buffer = vec![0u8; T::SIZE];
        value.write_le(&mut buffer);
        assert_eq!(T::read_le(&buffer), value);
    }

    #[test]
    fn elements_round_trip() {
        round_trip(1.5f64);
        round_trip(-2.25f32);
        round_trip(i64::MIN);
        round_trip(-7i16);
        round_trip(true);
        round_trip(42u32);
        round_trip(SwitchValue { index: 3, tag: 2 });
    }

    #[test]
    fn layout_is_little_endian() {
        let mut buffer = [0u8; 4];
        0x0102_0304u32.write_le(&mut buffer);
        assert_eq!(buffer, [4, 3, 2, 1]);

        let mut buffer = [0u8; 8];
        SwitchValue { index: 1, tag: 2 }.write_le(&mut buffer);
        assert_eq!(buffer, [1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[rstest]
    #[case(f64::SIZE, ColumnType::Real64)]
    #[case(f32::SIZE, ColumnType::Real32)]
    #[case(u32::SIZE, ColumnType::Index)]
    #[case(bool::SIZE, ColumnType::Bit)]
    #[case(SwitchValue::SIZE, ColumnType::Switch)]
    fn sizes_match_column_types(#[case] size: usize, #[case] column_type: ColumnType) {
        assert_eq!(size, column_type.element_size());
    }
}
