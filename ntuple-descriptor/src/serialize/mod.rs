//! The versioned binary encoding of descriptors.
//!
//! Every structure is written as a frame: a preamble of `(version current: u16, version min: u16,
//! size: u32)` followed by the payload. Readers skip payload bytes they do not understand, which
//! lets newer writers append members to a frame without breaking older readers.
//!
//! ```text
//! header   = frame { identity, [field frame], [column frame], crc32 }
//! footer   = frame { [cluster frame], crc32 } postscript
//! cluster  = frame { id, version, first entry, n entries, locator, [column range frame], [page range frame] }
//! postscript = frame { header size: u32, footer size: u32 }      (16 bytes)
//! ```
//!
//! All integers are little-endian, strings are a `u32` byte length followed by UTF-8 bytes and
//! timestamps are microseconds since the Unix epoch.

mod footer;
mod frame;
mod header;

pub(crate) use footer::*;
pub use frame::{FRAME_VERSION_CURRENT, FRAME_VERSION_MIN, N_BYTES_POSTSCRIPT, N_BYTES_PREAMBLE};
pub(crate) use header::*;
