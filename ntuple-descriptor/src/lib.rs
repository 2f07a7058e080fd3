//! The metadata model of an ntuple.
//!
//! An [`NTupleDescriptor`] records the schema of a dataset (a tree of fields, each materialized
//! as zero or more columns) and its physical layout (clusters of entries, and for every column in
//! every cluster the window of elements it covers and the pages those elements live in).
//!
//! Descriptors are only ever mutated through an [`NTupleDescriptorBuilder`], either piece-wise
//! while writing or by decoding a serialized header and one or more footers while reading.

pub use builder::*;
pub use cluster::*;
pub use column::*;
pub use column_model::*;
pub use descriptor::*;
pub use field::*;
pub use id::*;
pub use locator::*;
pub use model::*;
pub use serialize::{FRAME_VERSION_CURRENT, FRAME_VERSION_MIN, N_BYTES_POSTSCRIPT, N_BYTES_PREAMBLE};

mod builder;
mod cluster;
mod column;
mod column_model;
mod descriptor;
mod field;
mod id;
mod locator;
mod model;
mod serialize;
