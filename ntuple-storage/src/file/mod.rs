//! The single-container layout: the header at offset zero, followed by the pages of every
//! cluster, followed by the footer whose last bytes are the postscript.

pub use sink::*;
pub use source::*;

mod sink;
mod source;
