pub mod cli;
pub mod config;
pub mod error;
pub mod packed;
pub mod tensor;

pub use config::PackingConfig;
pub use error::QLinearError;
pub use packed::{BackendKind, LinearPackedParams, PackedLinearWeight};
pub use tensor::{QScheme, Quantizer, Tensor, TensorDtype};
