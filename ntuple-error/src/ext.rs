use crate::NTupleResult;

/// Extension trait for NTupleResult
pub trait ResultExt<T>: private::Sealed {
    /// Flatten a nested [`NTupleResult`]. Helper function until <https://github.com/rust-lang/rust/issues/70142> is stabilized.
    fn flatten(self) -> NTupleResult<T>;
}

mod private {
    use crate::NTupleResult;

    pub trait Sealed {}

    impl<T> Sealed for NTupleResult<NTupleResult<T>> {}
}

impl<T> ResultExt<T> for NTupleResult<NTupleResult<T>> {
    fn flatten(self) -> NTupleResult<T> {
        match self {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{NTupleError, NTupleResult, ResultExt, ntuple_err};

    #[test]
    fn flatten_nested() {
        let ok: NTupleResult<NTupleResult<u32>> = Ok(Ok(3));
        assert_eq!(ok.flatten().unwrap(), 3);

        let inner: NTupleResult<NTupleResult<u32>> = Ok(Err(ntuple_err!(Schema: "inner")));
        assert!(matches!(inner.flatten(), Err(NTupleError::Schema(..))));

        let outer: NTupleResult<NTupleResult<u32>> = Err(ntuple_err!(Format: "outer"));
        assert!(matches!(outer.flatten(), Err(NTupleError::Format(..))));
    }
}
