//! Page storage for the ntuple columnar format.
//!
//! A [`PageSink`] writes the pages of every column, groups them into clusters and records the
//! layout in an [`NTupleDescriptor`](ntuple_descriptor::NTupleDescriptor); a [`PageSource`]
//! attaches to the stored metadata and serves pages by element index, optionally reading whole
//! clusters ahead on a background thread. Both delegate the physical I/O to a backend, of which
//! the single-container [`file`] backend is provided here.
//!
//! [`BufferedPageSink`] compresses the pages of a cluster in parallel before writing them, and
//! [`FriendsPageSource`] reads several ntuples with aligned entries as one.

pub use buffered::*;
pub use cluster::*;
pub use cluster_pool::*;
pub use compress::{CompressionSettings, compress, decompress};
pub use element::*;
pub use file::*;
pub use friends::*;
pub use options::*;
pub use page::*;
pub use pool::*;
pub use scheduler::*;
pub use sink::*;
pub use source::*;
pub use storage::*;

mod buffered;
mod cluster;
mod cluster_pool;
mod compress;
mod element;
pub mod file;
mod friends;
mod options;
mod page;
mod pool;
mod scheduler;
mod sink;
mod source;
mod storage;
