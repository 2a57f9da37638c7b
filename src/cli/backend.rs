//! Backend selection from CLI --backend flag.

use tracing::info;

use crate::error::QLinearError;
use crate::packed::{available_backends, BackendKind};

/// Resolve a packed-weight backend from the --backend CLI flag.
///
/// Accepted values: "auto" (default), "blocked-int8", "q8gemm", "fp16", "passthrough".
/// "auto" picks the first compiled backend that can hold the weight's dtype.
pub fn resolve_backend(name: Option<&str>, float_weight: bool) -> Result<BackendKind, QLinearError> {
    match name.unwrap_or("auto") {
        "auto" => {
            let kind = available_backends()
                .into_iter()
                .find(|k| match k {
                    BackendKind::Fp16 => float_weight,
                    BackendKind::BlockedInt8 | BackendKind::Q8Gemm => !float_weight,
                    BackendKind::Passthrough => true,
                })
                .ok_or_else(|| {
                    QLinearError::InvalidConfig("no compiled backend accepts this weight".to_string())
                })?;
            info!(backend = %kind, "Selected backend");
            Ok(kind)
        }
        other => {
            let kind: BackendKind = other.parse()?;
            if !kind.is_available() {
                return Err(QLinearError::BackendUnavailable(kind));
            }
            Ok(kind)
        }
    }
}
