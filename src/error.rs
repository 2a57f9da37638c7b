use thiserror::Error;

use crate::packed::BackendKind;
use crate::tensor::{QScheme, TensorDtype};

#[derive(Error, Debug)]
pub enum QLinearError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed packed weight: unsupported quantization scheme {0:?}")]
    MalformedScheme(QScheme),

    #[error("{backend} backend does not support {scheme:?} quantization")]
    UnsupportedScheme {
        backend: BackendKind,
        scheme: QScheme,
    },

    #[error("Zero point {0} does not fit in int8")]
    ZeroPointOutOfRange(i64),

    #[error("Postcondition violated: {0}")]
    PostconditionViolation(String),

    #[error(
        "Failed to allocate {elements} elements of {dtype:?} ({} bytes)",
        .elements.saturating_mul(.dtype.element_size())
    )]
    AllocationFailed {
        elements: usize,
        dtype: TensorDtype,
    },

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Dtype mismatch: expected {expected:?}, got {actual:?}")]
    DtypeMismatch {
        expected: TensorDtype,
        actual: TensorDtype,
    },

    #[error("{0} backend not available (compile with --features {0})")]
    BackendUnavailable(BackendKind),

    #[error("Unknown backend '{0}'. Options: blocked-int8, q8gemm, fp16, passthrough")]
    UnknownBackend(String),

    #[error("Invalid weight file: {0}")]
    InvalidWeightFile(String),

    #[error("Invalid packing config: {0}")]
    InvalidConfig(String),
}
