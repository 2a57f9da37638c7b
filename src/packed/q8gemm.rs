//! Unsigned-offset int8 panel layout (per-tensor affine only).
//!
//! The kernels behind this layout work on unsigned bytes, so packing shifts every signed
//! weight and the zero point up by [`KERNEL_ZERO_POINT_OFFSET`]. Weights are grouped into
//! panels of `nr` output channels; each panel walks K in steps of `kr`, storing an
//! `nr × kr` block per step. Slots past the matrix edge hold the kernel zero point.
//!
//! Unlike the blocked int8 layout, the recorded shape is the weight's own `[N, K]`.

use std::sync::Arc;

use tracing::debug;

use crate::config::Q8GemmParams;
use crate::error::QLinearError;
use crate::packed::{
    check_bias, padded_len, BackendKind, Bias, DenseWeight, LinearPackedParams, UnpackedWeight,
};
use crate::tensor::{try_alloc, QScheme, Quantizer, Tensor, TensorDtype};

/// Shift between signed int8 values and the unsigned bytes this layout stores.
pub const KERNEL_ZERO_POINT_OFFSET: i16 = 128;

/// Map a signed weight or zero point into the stored unsigned byte.
fn to_kernel_byte(v: i8) -> u8 {
    (v as i16 + KERNEL_ZERO_POINT_OFFSET) as u8
}

/// Undo the packing shift in place on bytes written by [`Q8GemmPackedMatrix::unpack_weights`].
pub fn remove_kernel_offset(values: &mut [i8]) {
    for v in values.iter_mut() {
        *v = (*v as u8 as i16 - KERNEL_ZERO_POINT_OFFSET) as i8;
    }
}

/// Panelled `[N, K]` matrix of offset bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Q8GemmPackedMatrix {
    output_channels: usize,
    input_channels: usize,
    params: Q8GemmParams,
    kernel_zero_point: u8,
    data: Vec<u8>,
}

impl Q8GemmPackedMatrix {
    /// Pack a row-major signed `[n, k]` weight with the given (signed) zero point.
    ///
    /// # Panics
    /// Panics if `weight.len() != n * k`.
    pub fn pack(
        weight: &[i8],
        n: usize,
        k: usize,
        zero_point: i8,
        params: Q8GemmParams,
    ) -> Result<Self, QLinearError> {
        assert_eq!(
            weight.len(),
            n * k,
            "Weight length {} does not match [{}, {}]",
            weight.len(),
            n,
            k
        );
        let kernel_zero_point = to_kernel_byte(zero_point);
        let len = padded_len(
            BackendKind::Q8Gemm,
            &[n.div_ceil(params.nr), k.div_ceil(params.kr), params.nr, params.kr],
        )?;
        let mut packed = Self {
            output_channels: n,
            input_channels: k,
            params,
            kernel_zero_point,
            data: try_alloc(len, kernel_zero_point, TensorDtype::QInt8)?,
        };
        for oc in 0..n {
            for ic in 0..k {
                let off = packed.offset(oc, ic);
                packed.data[off] = to_kernel_byte(weight[oc * k + ic]);
            }
        }
        debug!(n, k, ?params, packed_len = len, "Packed q8gemm matrix");
        Ok(packed)
    }

    fn offset(&self, oc: usize, ic: usize) -> usize {
        let Q8GemmParams { nr, kr } = self.params;
        let k_blocks = self.input_channels.div_ceil(kr);
        (oc / nr) * k_blocks * nr * kr + (ic / kr) * nr * kr + (oc % nr) * kr + ic % kr
    }

    /// N, the number of output channels.
    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// K, the number of input channels.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Zero point in the stored unsigned domain.
    pub fn kernel_zero_point(&self) -> u8 {
        self.kernel_zero_point
    }

    pub fn packed_len(&self) -> usize {
        self.data.len()
    }

    /// Write the stored bytes into `out` as row-major `[N, K]`, bit-reinterpreted as
    /// `i8`. The kernel offset is still applied; see [`remove_kernel_offset`].
    ///
    /// # Panics
    /// Panics if `out.len() != N * K`.
    pub fn unpack_weights(&self, out: &mut [i8]) {
        let (n, k) = (self.output_channels, self.input_channels);
        assert_eq!(
            out.len(),
            n * k,
            "Output length {} does not match [{}, {}]",
            out.len(),
            n,
            k
        );
        for oc in 0..n {
            for ic in 0..k {
                out[oc * k + ic] = self.data[self.offset(oc, ic)] as i8;
            }
        }
    }
}

/// Int8 weight in the q8gemm layout, optionally keeping the dense original.
#[derive(Debug, Clone)]
pub struct PackedLinearWeightsQnnp {
    w: Q8GemmPackedMatrix,
    orig_weight: Option<DenseWeight>,
    bias: Option<Bias>,
    weight_sizes: [usize; 2],
    w_scales: Vec<f64>,
    w_zero_points: Vec<u8>,
    q_scheme: QScheme,
}

impl PackedLinearWeightsQnnp {
    /// Pack a per-tensor QInt8 `[N, K]` weight.
    ///
    /// With `retain_original`, the dense tensor is kept and handed back by `unpack()`
    /// without reconstruction.
    pub fn prepack(
        weight: DenseWeight,
        bias: Option<Bias>,
        params: &Q8GemmParams,
        retain_original: bool,
    ) -> Result<Self, QLinearError> {
        if weight.dtype() != TensorDtype::QInt8 {
            return Err(QLinearError::DtypeMismatch {
                expected: TensorDtype::QInt8,
                actual: weight.dtype(),
            });
        }
        let (n, k) = weight.dims_2d()?;
        check_bias(bias.as_ref(), n)?;

        let (scale, zero_point) = match weight.quantizer() {
            Some(Quantizer::PerTensorAffine { scale, zero_point }) => (*scale, *zero_point),
            // TODO: per-channel weights need one kernel zero point per output channel.
            Some(q) => {
                return Err(QLinearError::UnsupportedScheme {
                    backend: BackendKind::Q8Gemm,
                    scheme: q.qscheme(),
                })
            }
            None => unreachable!("QInt8 tensor must carry a quantizer"),
        };
        let zero_point = i8::try_from(zero_point)
            .map_err(|_| QLinearError::ZeroPointOutOfRange(zero_point))?;

        let w = Q8GemmPackedMatrix::pack(weight.as_i8(), n, k, zero_point, *params)?;
        Ok(Self {
            w_zero_points: vec![w.kernel_zero_point()],
            w,
            orig_weight: retain_original.then_some(weight),
            bias,
            weight_sizes: [n, k],
            w_scales: vec![scale],
            q_scheme: QScheme::PerTensorAffine,
        })
    }

    /// Assemble a packed weight from parts produced elsewhere. Checks happen in `unpack()`.
    pub fn from_raw_parts(
        w: Q8GemmPackedMatrix,
        orig_weight: Option<DenseWeight>,
        bias: Option<Bias>,
        w_scales: Vec<f64>,
        w_zero_points: Vec<u8>,
        q_scheme: QScheme,
    ) -> Self {
        Self {
            weight_sizes: [w.output_channels(), w.input_channels()],
            w,
            orig_weight,
            bias,
            w_scales,
            w_zero_points,
            q_scheme,
        }
    }

    pub fn packed_matrix(&self) -> &Q8GemmPackedMatrix {
        &self.w
    }

    /// Whether `unpack()` returns a retained original instead of reconstructing.
    pub fn has_original(&self) -> bool {
        self.orig_weight.is_some()
    }
}

impl LinearPackedParams for PackedLinearWeightsQnnp {
    fn unpack(&self) -> Result<UnpackedWeight, QLinearError> {
        if let Some(orig) = &self.orig_weight {
            return Ok((Arc::clone(orig), self.bias.clone()));
        }

        match self.q_scheme {
            QScheme::PerTensorAffine => {}
            QScheme::PerChannelAffine => {
                return Err(QLinearError::UnsupportedScheme {
                    backend: BackendKind::Q8Gemm,
                    scheme: QScheme::PerChannelAffine,
                })
            }
            other => return Err(QLinearError::MalformedScheme(other)),
        }
        let (scale, kernel_zp) = match (self.w_scales.first(), self.w_zero_points.first()) {
            (Some(&s), Some(&zp)) => (s, zp),
            _ => {
                return Err(QLinearError::ShapeMismatch {
                    expected: vec![1],
                    actual: vec![self.w_scales.len().min(self.w_zero_points.len())],
                })
            }
        };
        let zero_point = (kernel_zp as i16 - KERNEL_ZERO_POINT_OFFSET) as i64;

        let [n, k] = self.weight_sizes;
        let mut values = try_alloc(n * k, 0i8, TensorDtype::QInt8)?;
        self.w.unpack_weights(&mut values);
        remove_kernel_offset(&mut values);

        let weight = Tensor::from_qint8(
            self.weight_sizes.to_vec(),
            values,
            Quantizer::per_tensor(scale, zero_point),
        )?;
        // Cannot fail with `Quantizer::per_tensor` above; kept as the unpack postcondition.
        if weight.qscheme() != Some(QScheme::PerTensorAffine) {
            return Err(QLinearError::PostconditionViolation(format!(
                "q8gemm unpack produced {:?}, expected per-tensor affine",
                weight.qscheme()
            )));
        }
        Ok((Arc::new(weight), self.bias.clone()))
    }

    fn bias(&self) -> Option<Bias> {
        self.bias.clone()
    }

    fn output_features(&self) -> usize {
        self.weight_sizes[0]
    }

    fn input_features(&self) -> usize {
        self.weight_sizes[1]
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Q8Gemm
    }
}
