use crate::dtype::DataType;

/// Errors raised by tensor construction, storage access and compute primitives.
///
/// Variants fall into three groups: configuration (`InvalidConfig`,
/// `UnsupportedDType`), argument validation (shapes, indices, axes) and
/// state (`NotAllocated`, `StorageError`, `UninitializedHandle`).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TesseraError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not supported for dtype {0}")]
    UnsupportedDType(DataType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DataType, got: DataType },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index {index:?} out of range for dimension {dim:?}")]
    IndexOutOfRange { index: [usize; 4], dim: [usize; 4] },

    #[error("axis {axis} out of range for a {ndim}-d tensor")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("matmul dimension mismatch: [{m}, {k1}] @ [{k2}, {n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("cannot broadcast {b:?} onto {a:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("tensor '{0}' is not allocated")]
    NotAllocated(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("uninitialized handle: {0}")]
    UninitializedHandle(String),
}

impl TesseraError {
    /// Whether the error belongs to the argument-validation group.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            TesseraError::InvalidArgument(_)
                | TesseraError::IndexOutOfRange { .. }
                | TesseraError::InvalidAxis { .. }
                | TesseraError::ShapeMismatch { .. }
                | TesseraError::MatmulDimMismatch { .. }
                | TesseraError::BroadcastError { .. }
                | TesseraError::DTypeMismatch { .. }
        )
    }

    /// Whether the error is a state error (unallocated or released storage).
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            TesseraError::NotAllocated(_)
                | TesseraError::StorageError(_)
                | TesseraError::UninitializedHandle(_)
        )
    }
}

impl From<tessera_kernels::GemmError> for TesseraError {
    fn from(err: tessera_kernels::GemmError) -> Self {
        TesseraError::StorageError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_groups() {
        assert!(TesseraError::InvalidArgument("x".into()).is_argument_error());
        assert!(TesseraError::InvalidAxis { axis: 4, ndim: 4 }.is_argument_error());
        assert!(TesseraError::NotAllocated("w".into()).is_state_error());
        assert!(!TesseraError::UnsupportedDType(DataType::QInt8).is_argument_error());
        assert!(!TesseraError::InvalidConfig("fp16".into()).is_state_error());
    }

    #[test]
    fn test_display() {
        let err = TesseraError::MatmulDimMismatch { m: 2, k1: 3, k2: 4, n: 5 };
        assert_eq!(err.to_string(), "matmul dimension mismatch: [2, 3] @ [4, 5]");
        let err = TesseraError::UnsupportedDType(DataType::QInt4);
        assert_eq!(err.to_string(), "operation not supported for dtype qint4");
    }
}
