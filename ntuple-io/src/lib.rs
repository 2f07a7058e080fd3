//! Core traits and implementations for blocking IO.
//!
//! The ntuple container format runs on top of any storage that supports positioned reads
//! (for attaching and populating pages) and appending writes (for committing pages and
//! metadata). This crate provides those two traits and implements them for in-memory
//! buffers and local files.

pub use offset::*;
pub use ranges::*;
pub use read::*;
pub use write::*;

mod offset;
mod ranges;
mod read;
mod write;
