//! Columnar storage of event data.
//!
//! Datasets are written entry by entry through a [`PageSink`], which packs the elements of every
//! column into pages, groups them into clusters and finally serializes an
//! [`NTupleDescriptor`](descriptor::NTupleDescriptor) as header and footer. A [`PageSource`]
//! reads that metadata back and serves pages by element index.

pub use ntuple_storage::*;
pub use {
    ntuple_descriptor as descriptor, ntuple_error as error, ntuple_io as io,
    ntuple_metrics as metrics,
};
