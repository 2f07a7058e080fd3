#![feature(error_generic_member_access)]
#![deny(missing_docs)]

//! This crate defines error & result types for the ntuple storage crates.
//! It also contains a variety of useful macros for error handling.

mod ext;

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::num::TryFromIntError;
use std::ops::Deref;
use std::{env, fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    #[allow(clippy::panic)]
    fn from(msg: T) -> Self {
        if env::var("NTUPLE_PANIC_ON_ERR").as_deref().unwrap_or("") == "1" {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for the ntuple storage crates.
///
/// Each variant corresponds to one failure family: schema inconsistencies raised by the
/// descriptor builder, malformed or version-incompatible serialized frames, lookups that
/// the caller required to succeed, protocol order violations, and physical I/O faults.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum NTupleError {
    /// A builder call would leave the descriptor internally inconsistent.
    #[error("schema error: {0}\nBacktrace:\n{1}")]
    Schema(ErrString, Backtrace),
    /// A serialized header, footer or postscript could not be decoded.
    #[error("format error: {0}\nBacktrace:\n{1}")]
    Format(ErrString, Backtrace),
    /// An index is out of bounds.
    #[error("index {0} out of bounds from {1} to {2}\nBacktrace:\n{3}")]
    OutOfBounds(u64, u64, u64, Backtrace),
    /// An invalid argument was provided.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Backtrace),
    /// An operation was called out of protocol order.
    #[error("invalid state: {0}\nBacktrace:\n{1}")]
    InvalidState(ErrString, Backtrace),
    /// A wrapper for errors from the standard library's I/O.
    #[error("io error: {0}\nBacktrace:\n{1}")]
    IOError(#[from] io::Error, Backtrace),
    /// A wrapper for other errors, carrying additional context.
    #[error("{0}: {1}")]
    Context(ErrString, Box<NTupleError>),
}

impl NTupleError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        NTupleError::Context(msg.into(), Box::new(self))
    }

    /// Returns true if this error, or the error it wraps, is a format error.
    pub fn is_format(&self) -> bool {
        match self {
            NTupleError::Format(..) => true,
            NTupleError::Context(_, inner) => inner.is_format(),
            _ => false,
        }
    }

    /// Returns true if this error, or the error it wraps, is a schema error.
    pub fn is_schema(&self) -> bool {
        match self {
            NTupleError::Schema(..) => true,
            NTupleError::Context(_, inner) => inner.is_schema(),
            _ => false,
        }
    }
}

impl Debug for NTupleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<TryFromIntError> for NTupleError {
    fn from(value: TryFromIntError) -> Self {
        NTupleError::InvalidArgument(value.to_string().into(), Backtrace::capture())
    }
}

impl From<NTupleError> for io::Error {
    fn from(value: NTupleError) -> Self {
        match value {
            NTupleError::IOError(err, _) => err,
            other => io::Error::other(other),
        }
    }
}

/// A type alias for Results that return NTupleErrors as their error type.
pub type NTupleResult<T> = Result<T, NTupleError>;

/// A convenient macro for creating an NTupleError.
///
/// The leading identifier selects the variant, e.g. `ntuple_err!(Format: "bad frame {}", id)`.
/// Without a variant the error is an [`NTupleError::InvalidArgument`].
#[macro_export]
macro_rules! ntuple_err {
    (OutOfBounds: $idx:expr, $start:expr, $stop:expr) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::NTupleError::OutOfBounds($idx, $start, $stop, Backtrace::capture())
        )
    }};
    (Context: $msg:literal, $err:expr) => {{
        $crate::__private::must_use(
            $crate::NTupleError::Context($msg.into(), Box::new($err))
        )
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::NTupleError::$variant(format!($fmt, $($arg),*).into(), Backtrace::capture())
        )
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::ntuple_err!(InvalidArgument: $fmt, $($arg),*)
    };
}

/// A convenient macro for returning an NTupleError.
#[macro_export]
macro_rules! ntuple_bail {
    ($($tt:tt)+) => {
        return Err($crate::ntuple_err!($($tt)+))
    };
}

#[doc(hidden)]
pub mod __private {
    #[doc(hidden)]
    #[inline]
    #[must_use]
    pub fn must_use(error: crate::NTupleError) -> crate::NTupleError {
        error
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn macro_variants() {
        let frame = "header";
        let err = ntuple_err!(Format: "{frame} frame truncated at {}", 12);
        assert!(err.is_format());
        assert!(err.to_string().contains("header frame truncated at 12"));

        let err = ntuple_err!("plain {}", "argument");
        assert!(matches!(err, NTupleError::InvalidArgument(..)));

        let err = ntuple_err!(OutOfBounds: 10, 0, 5);
        assert!(err.to_string().starts_with("index 10 out of bounds from 0 to 5"));
    }

    #[test]
    fn context_preserves_kind() {
        let err = ntuple_err!(Schema: "duplicate field id 3").with_context("while adding field");
        assert!(err.is_schema());
        assert!(!err.is_format());
        assert!(err.to_string().starts_with("while adding field: schema error"));
    }

    #[test]
    fn bail_returns_early() {
        fn check(v: u32) -> NTupleResult<u32> {
            if v > 3 {
                ntuple_bail!(InvalidState: "value {} too large", v);
            }
            Ok(v)
        }
        assert_eq!(check(2).unwrap(), 2);
        assert!(matches!(check(4), Err(NTupleError::InvalidState(..))));
    }

    #[test]
    fn io_conversions() {
        let err: NTupleError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::UnexpectedEof);

        let back: io::Error = ntuple_err!(Format: "bad").into();
        assert_eq!(back.kind(), io::ErrorKind::Other);
    }
}
