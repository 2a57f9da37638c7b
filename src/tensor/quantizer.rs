//! Quantization metadata attached to QInt8 tensors.

use serde::{Deserialize, Serialize};

use crate::error::QLinearError;

/// Quantization scheme tag carried by a packed weight.
///
/// Packed weights may record any of these, but only the two affine schemes
/// describe a layout that can be turned back into a dense tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QScheme {
    PerTensorAffine,
    PerChannelAffine,
    PerTensorSymmetric,
    PerChannelSymmetric,
    PerChannelAffineFloatQParams,
}

/// Affine quantization parameters of a QInt8 tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Quantizer {
    /// One `(scale, zero_point)` pair for the whole tensor.
    PerTensorAffine { scale: f64, zero_point: i64 },
    /// One `(scale, zero_point)` pair per slice along `axis`.
    PerChannelAffine {
        scales: Vec<f64>,
        zero_points: Vec<i64>,
        axis: usize,
    },
}

impl Quantizer {
    pub fn per_tensor(scale: f64, zero_point: i64) -> Self {
        Quantizer::PerTensorAffine { scale, zero_point }
    }

    pub fn per_channel(scales: Vec<f64>, zero_points: Vec<i64>, axis: usize) -> Self {
        Quantizer::PerChannelAffine {
            scales,
            zero_points,
            axis,
        }
    }

    /// The scheme tag this quantizer implements.
    pub fn qscheme(&self) -> QScheme {
        match self {
            Quantizer::PerTensorAffine { .. } => QScheme::PerTensorAffine,
            Quantizer::PerChannelAffine { .. } => QScheme::PerChannelAffine,
        }
    }

    /// Check that per-channel arrays match the channel dimension of `shape`.
    pub fn validate(&self, shape: &[usize]) -> Result<(), QLinearError> {
        match self {
            Quantizer::PerTensorAffine { .. } => Ok(()),
            Quantizer::PerChannelAffine {
                scales,
                zero_points,
                axis,
            } => {
                let channels = *shape.get(*axis).ok_or_else(|| QLinearError::ShapeMismatch {
                    expected: shape.to_vec(),
                    actual: vec![*axis],
                })?;
                if scales.len() != channels {
                    return Err(QLinearError::ShapeMismatch {
                        expected: vec![channels],
                        actual: vec![scales.len()],
                    });
                }
                if zero_points.len() != channels {
                    return Err(QLinearError::ShapeMismatch {
                        expected: vec![channels],
                        actual: vec![zero_points.len()],
                    });
                }
                Ok(())
            }
        }
    }
}
