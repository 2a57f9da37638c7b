//! Packed linear weights and the uniform unpack contract.
//!
//! Defines the [`LinearPackedParams`] trait implemented by every backend layout, and
//! [`PackedLinearWeight`], a closed tagged union over the backends compiled into this
//! build. Each backend reconstructs `(weight [N, K], bias)` from its own fields; there is
//! no shared decode path.
//!
//! Which backends exist is decided at build time by cargo features (`blocked-int8`,
//! `q8gemm`, `fp16`, `passthrough`). Asking for a backend that was compiled out is a
//! configuration error ([`QLinearError::BackendUnavailable`]).

#[cfg(feature = "blocked-int8")]
pub mod blocked_int8;
#[cfg(feature = "fp16")]
pub mod fp16;
#[cfg(feature = "passthrough")]
pub mod passthrough;
#[cfg(feature = "q8gemm")]
pub mod q8gemm;

#[cfg(not(any(
    feature = "blocked-int8",
    feature = "q8gemm",
    feature = "fp16",
    feature = "passthrough"
)))]
compile_error!("at least one packed weight backend feature must be enabled");

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::PackingConfig;
use crate::error::QLinearError;
use crate::tensor::Tensor;

#[cfg(feature = "blocked-int8")]
use blocked_int8::PackedLinearWeightInt8;
#[cfg(feature = "fp16")]
use fp16::PackedLinearWeightFp16;
#[cfg(feature = "passthrough")]
use passthrough::PackedLinearWeightsPassthrough;
#[cfg(feature = "q8gemm")]
use q8gemm::PackedLinearWeightsQnnp;

/// Dense `[N, K]` weight handed back by `unpack()`.
///
/// Fresh for backends that reconstruct; shared with the packed weight for backends that
/// cache the original. The `Arc` makes the shared case read-only for every holder.
pub type DenseWeight = Arc<Tensor>;

/// Bias vector of length N. The same allocation is returned on every unpack.
pub type Bias = Arc<[f32]>;

/// Result of unpacking a packed weight.
pub type UnpackedWeight = (DenseWeight, Option<Bias>);

/// Packed weight layouts known to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Tiled, row-interleaved int8 layout with per-tensor or per-channel metadata.
    BlockedInt8,
    /// Unsigned-offset int8 panels, per-tensor only, optional dense cache.
    Q8Gemm,
    /// Column-panelled float16 layout.
    Fp16,
    /// Keeps the dense tensor as-is.
    Passthrough,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::BlockedInt8,
        BackendKind::Q8Gemm,
        BackendKind::Fp16,
        BackendKind::Passthrough,
    ];

    /// Name used on the command line and as the cargo feature name.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::BlockedInt8 => "blocked-int8",
            BackendKind::Q8Gemm => "q8gemm",
            BackendKind::Fp16 => "fp16",
            BackendKind::Passthrough => "passthrough",
        }
    }

    /// Whether this backend was compiled into the current build.
    pub fn is_available(self) -> bool {
        match self {
            BackendKind::BlockedInt8 => cfg!(feature = "blocked-int8"),
            BackendKind::Q8Gemm => cfg!(feature = "q8gemm"),
            BackendKind::Fp16 => cfg!(feature = "fp16"),
            BackendKind::Passthrough => cfg!(feature = "passthrough"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for BackendKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = QLinearError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| QLinearError::UnknownBackend(s.to_string()))
    }
}

/// Backends compiled into this build, in preference order.
pub fn available_backends() -> Vec<BackendKind> {
    BackendKind::ALL
        .into_iter()
        .filter(|kind| kind.is_available())
        .collect()
}

/// Contract shared by every packed weight layout.
///
/// `unpack()` never mutates the packed weight, so it may be called any number of times
/// and from several threads at once.
pub trait LinearPackedParams: Send + Sync + fmt::Debug {
    /// Reconstruct the dense `[N, K]` weight and return it with the stored bias.
    fn unpack(&self) -> Result<UnpackedWeight, QLinearError>;

    /// The bias recorded at pack time.
    fn bias(&self) -> Option<Bias>;

    /// N, the number of output features.
    fn output_features(&self) -> usize;

    /// K, the number of input features.
    fn input_features(&self) -> usize;

    /// Which layout this weight is stored in.
    fn backend(&self) -> BackendKind;
}

/// Bias must have one entry per output feature.
pub(crate) fn check_bias(bias: Option<&Bias>, output_features: usize) -> Result<(), QLinearError> {
    match bias {
        Some(b) if b.len() != output_features => Err(QLinearError::ShapeMismatch {
            expected: vec![output_features],
            actual: vec![b.len()],
        }),
        _ => Ok(()),
    }
}

/// Product of padded layout dimensions, or `InvalidConfig` if it does not fit in `usize`.
#[cfg(any(feature = "blocked-int8", feature = "q8gemm", feature = "fp16"))]
pub(crate) fn padded_len(backend: BackendKind, dims: &[usize]) -> Result<usize, QLinearError> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            QLinearError::InvalidConfig(format!(
                "{} packed buffer {:?} overflows usize",
                backend, dims
            ))
        })
}

/// A packed weight in one of the compiled backend layouts.
#[derive(Debug, Clone)]
pub enum PackedLinearWeight {
    #[cfg(feature = "blocked-int8")]
    BlockedInt8(PackedLinearWeightInt8),
    #[cfg(feature = "q8gemm")]
    Q8Gemm(PackedLinearWeightsQnnp),
    #[cfg(feature = "fp16")]
    Fp16(PackedLinearWeightFp16),
    #[cfg(feature = "passthrough")]
    Passthrough(PackedLinearWeightsPassthrough),
}

impl PackedLinearWeight {
    /// Pack a dense `[N, K]` weight into the layout of `kind`.
    ///
    /// Integer backends expect a QInt8 weight; the fp16 backend expects F32.
    pub fn prepack(
        kind: BackendKind,
        weight: DenseWeight,
        bias: Option<Bias>,
        config: &PackingConfig,
    ) -> Result<Self, QLinearError> {
        config.validate()?;
        info!(backend = %kind, shape = ?weight.shape(), has_bias = bias.is_some(), "Packing weight");

        match kind {
            BackendKind::BlockedInt8 => {
                #[cfg(feature = "blocked-int8")]
                {
                    PackedLinearWeightInt8::prepack(&weight, bias, &config.blocked_int8)
                        .map(Self::BlockedInt8)
                }
                #[cfg(not(feature = "blocked-int8"))]
                {
                    Err(QLinearError::BackendUnavailable(kind))
                }
            }
            BackendKind::Q8Gemm => {
                #[cfg(feature = "q8gemm")]
                {
                    PackedLinearWeightsQnnp::prepack(
                        weight,
                        bias,
                        &config.q8gemm,
                        config.retain_original,
                    )
                    .map(Self::Q8Gemm)
                }
                #[cfg(not(feature = "q8gemm"))]
                {
                    Err(QLinearError::BackendUnavailable(kind))
                }
            }
            BackendKind::Fp16 => {
                #[cfg(feature = "fp16")]
                {
                    PackedLinearWeightFp16::prepack(&weight, bias, &config.fp16).map(Self::Fp16)
                }
                #[cfg(not(feature = "fp16"))]
                {
                    Err(QLinearError::BackendUnavailable(kind))
                }
            }
            BackendKind::Passthrough => {
                #[cfg(feature = "passthrough")]
                {
                    PackedLinearWeightsPassthrough::prepack(weight, bias).map(Self::Passthrough)
                }
                #[cfg(not(feature = "passthrough"))]
                {
                    Err(QLinearError::BackendUnavailable(kind))
                }
            }
        }
    }

    /// Unpack and pack again with the same backend.
    ///
    /// The result holds the same dimensions, metadata and element values as `self`.
    pub fn repack(&self, config: &PackingConfig) -> Result<Self, QLinearError> {
        let (weight, bias) = self.unpack()?;
        Self::prepack(self.backend(), weight, bias, config)
    }

    fn inner(&self) -> &dyn LinearPackedParams {
        match self {
            #[cfg(feature = "blocked-int8")]
            PackedLinearWeight::BlockedInt8(w) => w,
            #[cfg(feature = "q8gemm")]
            PackedLinearWeight::Q8Gemm(w) => w,
            #[cfg(feature = "fp16")]
            PackedLinearWeight::Fp16(w) => w,
            #[cfg(feature = "passthrough")]
            PackedLinearWeight::Passthrough(w) => w,
        }
    }
}

impl LinearPackedParams for PackedLinearWeight {
    fn unpack(&self) -> Result<UnpackedWeight, QLinearError> {
        let inner = self.inner();
        let unpacked = inner.unpack()?;
        debug!(
            backend = %inner.backend(),
            shape = ?unpacked.0.shape(),
            dtype = ?unpacked.0.dtype(),
            "Unpacked weight"
        );
        Ok(unpacked)
    }

    fn bias(&self) -> Option<Bias> {
        self.inner().bias()
    }

    fn output_features(&self) -> usize {
        self.inner().output_features()
    }

    fn input_features(&self) -> usize {
        self.inner().input_features()
    }

    fn backend(&self) -> BackendKind {
        self.inner().backend()
    }
}
