use log::debug;
use ntuple_descriptor::{ClusterSize, DescriptorId, Locator, NTupleDescriptor};
use ntuple_error::{NTupleResult, ntuple_bail, ntuple_err};
use ntuple_io::{CountingWrite, NTupleWrite};

use crate::SinkBackend;

/// Appends an ntuple to a writer that starts out empty.
pub struct FileSinkBackend<W> {
    write: CountingWrite<W>,
    cluster_start: u64,
}

impl<W: NTupleWrite> FileSinkBackend<W> {
    pub fn new(write: W) -> Self {
        Self {
            write: CountingWrite::new(write),
            cluster_start: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> u64 {
        self.write.position()
    }

    pub fn into_inner(self) -> W {
        self.write.into_inner()
    }

    fn offset(&self) -> NTupleResult<i64> {
        i64::try_from(self.write.position())
            .map_err(|_| ntuple_err!("write position {} exceeds the locator range", self.write.position()))
    }
}

impl<W: NTupleWrite> SinkBackend for FileSinkBackend<W> {
    fn create(&mut self, descriptor: &NTupleDescriptor) -> NTupleResult<()> {
        if self.write.position() != 0 {
            ntuple_bail!(
                InvalidState: "the header must be the first bytes, but {} bytes are written",
                self.write.position()
            );
        }
        let header = descriptor.header_bytes()?;
        self.write.write_all(&header)?;
        self.cluster_start = self.write.position();
        debug!("wrote header of {} bytes", header.len());
        Ok(())
    }

    fn commit_page(&mut self, _column_id: DescriptorId, sealed: &[u8]) -> NTupleResult<Locator> {
        let locator = Locator::new(self.offset()?, u32::try_from(sealed.len())?);
        self.write.write_all(sealed)?;
        Ok(locator)
    }

    fn commit_cluster(&mut self, _n_entries: ClusterSize) -> NTupleResult<Locator> {
        let extent = self.write.position() - self.cluster_start;
        let Ok(size) = u32::try_from(extent) else {
            ntuple_bail!("cluster of {extent} bytes exceeds the 32bit locator size");
        };
        let locator = Locator::new(
            i64::try_from(self.cluster_start)?,
            size,
        );
        self.write.flush()?;
        self.cluster_start = self.write.position();
        Ok(locator)
    }

    fn commit_dataset(&mut self, descriptor: &NTupleDescriptor) -> NTupleResult<()> {
        let footer = descriptor.footer_bytes()?;
        self.write.write_all(&footer)?;
        self.write.shutdown()?;
        debug!(
            "wrote footer of {} bytes, container is {} bytes",
            footer.len(),
            self.write.position()
        );
        Ok(())
    }
}
