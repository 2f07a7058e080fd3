use std::fmt::{Display, Formatter};

use log::debug;
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};

/// How the pages of a column in a cluster are compressed, encoded as `algorithm * 100 + level`.
///
/// Algorithm `0` (or level `0`) stores pages as they are. Algorithm `5` is zstd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressionSettings(i64);

impl CompressionSettings {
    pub const UNCOMPRESSED: Self = Self(0);

    pub const ALGORITHM_NONE: i64 = 0;
    pub const ALGORITHM_ZSTD: i64 = 5;

    pub const fn zstd(level: u8) -> Self {
        Self(Self::ALGORITHM_ZSTD * 100 + level as i64)
    }

    pub const fn from_raw(settings: i64) -> Self {
        Self(settings)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    pub fn algorithm(&self) -> i64 {
        self.0 / 100
    }

    pub fn level(&self) -> i64 {
        self.0 % 100
    }

    pub fn is_uncompressed(&self) -> bool {
        self.algorithm() == Self::ALGORITHM_NONE || self.level() == 0
    }

    /// Fails for settings that pages cannot be written with.
    pub fn validate(&self) -> NTupleResult<()> {
        if self.0 < 0 {
            ntuple_bail!("invalid compression settings {}", self.0);
        }
        if !self.is_uncompressed() && self.algorithm() != Self::ALGORITHM_ZSTD {
            ntuple_bail!("unsupported compression algorithm {} in settings {}", self.algorithm(), self.0);
        }
        Ok(())
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self::zstd(5)
    }
}

impl Display for CompressionSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.algorithm() {
            _ if self.is_uncompressed() => write!(f, "uncompressed"),
            Self::ALGORITHM_ZSTD => write!(f, "zstd({})", self.level()),
            other => write!(f, "algorithm {other} level {}", self.level()),
        }
    }
}

/// Compress a packed page.
///
/// Returns `None` if the page should be stored as is, either because compression is disabled or
/// because it would not make the page smaller. Readers rely on a stored page being smaller than
/// its packed size if and only if it is compressed.
pub fn compress(settings: CompressionSettings, packed: &[u8]) -> NTupleResult<Option<Vec<u8>>> {
    settings.validate()?;
    if settings.is_uncompressed() || packed.is_empty() {
        return Ok(None);
    }
    let level = i32::try_from(settings.level())?;
    let zipped = zstd::bulk::compress(packed, level)?;
    if zipped.len() >= packed.len() {
        debug!(
            "{settings} does not shrink a page of {} bytes, storing it uncompressed",
            packed.len()
        );
        return Ok(None);
    }
    Ok(Some(zipped))
}

/// Restore the packed bytes of a page stored with `settings`.
pub fn decompress(
    settings: CompressionSettings,
    stored: &[u8],
    packed_size: usize,
) -> NTupleResult<Vec<u8>> {
    if settings.algorithm() != CompressionSettings::ALGORITHM_ZSTD {
        ntuple_bail!(
            Format: "page of {} bytes is stored compressed ({packed_size} bytes packed) with unsupported settings {}",
            stored.len(),
            settings.raw()
        );
    }
    let unzipped = zstd::bulk::decompress(stored, packed_size)
        .map_err(|e| ntuple_err!(Format: "corrupt compressed page of {} bytes: {e}", stored.len()))?;
    if unzipped.len() != packed_size {
        ntuple_bail!(
            Format: "compressed page unpacks to {} bytes, expected {packed_size}",
            unzipped.len()
        );
    }
    Ok(unzipped)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CompressionSettings::default(), 5, 5, false)]
    #[case(CompressionSettings::UNCOMPRESSED, 0, 0, true)]
    #[case(CompressionSettings::from_raw(500), 5, 0, true)]
    #[case(CompressionSettings::zstd(19), 5, 19, false)]
    fn settings_encoding(
        #[case] settings: CompressionSettings,
        #[case] algorithm: i64,
        #[case] level: i64,
        #[case] uncompressed: bool,
    ) {
        assert_eq!(settings.algorithm(), algorithm);
        assert_eq!(settings.level(), level);
        assert_eq!(settings.is_uncompressed(), uncompressed);
        settings.validate().unwrap();
    }

    #[test]
    fn default_is_zstd_level_5() {
        assert_eq!(CompressionSettings::default().raw(), 505);
        assert_eq!(CompressionSettings::default().to_string(), "zstd(5)");
    }

    #[test]
    fn unsupported_algorithm() {
        assert!(CompressionSettings::from_raw(101).validate().is_err());
        assert!(compress(CompressionSettings::from_raw(101), b"abc").is_err());
    }

    #[test]
    fn compressible_page_round_trips() {
        let packed = vec![7u8; 4096];
        let zipped = compress(CompressionSettings::default(), &packed)
            .unwrap()
            .unwrap();
        assert!(zipped.len() < packed.len());
        let unzipped = decompress(CompressionSettings::default(), &zipped, packed.len()).unwrap();
        assert_eq!(unzipped, packed);
    }

    #[test]
    fn incompressible_page_is_stored_raw() {
        assert!(compress(CompressionSettings::default(), &[1, 2, 3]).unwrap().is_none());
        assert!(compress(CompressionSettings::UNCOMPRESSED, &[0; 1024]).unwrap().is_none());
    }

    #[test]
    fn corrupt_page_is_a_format_error() {
        let err = decompress(CompressionSettings::default(), &[1, 2, 3], 16).unwrap_err();
        assert!(err.is_format());
    }
}
