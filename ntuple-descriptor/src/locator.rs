use std::ops::Range;

use ntuple_error::{NTupleResult, ntuple_bail};

/// Where a page or a cluster lives on storage.
///
/// The meaning of the position depends on the storage backend; for a file container it is a byte
/// offset. Objects on storage can be compressed, so the size on storage is recorded separately
/// from the size in memory. A non-empty url names a resource other than the container itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Locator {
    position: i64,
    bytes_on_storage: u32,
    url: String,
}

impl Locator {
    pub fn new(position: i64, bytes_on_storage: u32) -> Self {
        Self {
            position,
            bytes_on_storage,
            url: String::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn bytes_on_storage(&self) -> u32 {
        self.bytes_on_storage
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// True if the bytes live outside of the container that holds the metadata.
    pub fn is_external(&self) -> bool {
        !self.url.is_empty()
    }

    /// The byte range addressed by this locator within its resource.
    pub fn byte_range(&self) -> NTupleResult<Range<u64>> {
        let Ok(start) = u64::try_from(self.position) else {
            ntuple_bail!(Format: "negative locator position {}", self.position);
        };
        Ok(start..start + u64::from(self.bytes_on_storage))
    }
}
