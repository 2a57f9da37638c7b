//! Column-panelled float16 layout.
//!
//! The packed matrix is `B = Wᵀ` with `nrows = K` and `ncols = N`, split into panels of
//! `block_cols` columns. Each panel stores its K rows contiguously; the last panel is
//! zero padded to full width. Unpacking with [`MatrixOp::Transpose`] writes `Bᵀ`
//! straight into a `[N, K]` buffer, so no separate transpose pass is needed.

use std::sync::Arc;

use half::f16;
use tracing::{debug, warn};

use crate::config::Fp16Params;
use crate::error::QLinearError;
use crate::packed::{
    check_bias, padded_len, BackendKind, Bias, LinearPackedParams, UnpackedWeight,
};
use crate::tensor::{try_alloc, Tensor, TensorDtype};

/// Orientation of a dense buffer relative to the packed matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixOp {
    /// Dense buffer is `[nrows, ncols]`.
    NoTranspose,
    /// Dense buffer is `[ncols, nrows]`.
    Transpose,
}

/// Narrow to f16, clamping values outside the finite f16 range.
///
/// Returns the value and whether it was clamped.
fn saturating_f16(v: f32) -> (f16, bool) {
    let max = f16::MAX.to_f32();
    if v > max {
        (f16::MAX, true)
    } else if v < -max {
        (f16::MIN, true)
    } else {
        (f16::from_f32(v), false)
    }
}

/// Float16 matrix of logical shape `[nrows, ncols]` in column panels.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedGemmMatrixFp16 {
    nrows: usize,
    ncols: usize,
    block_cols: usize,
    data: Vec<f16>,
}

impl PackedGemmMatrixFp16 {
    /// Pack a dense f32 buffer, narrowing to f16.
    ///
    /// `op` describes how `src` is laid out: `NoTranspose` for `[nrows, ncols]`,
    /// `Transpose` for `[ncols, nrows]`.
    ///
    /// # Panics
    /// Panics if `src.len() != nrows * ncols`.
    pub fn pack(
        op: MatrixOp,
        nrows: usize,
        ncols: usize,
        src: &[f32],
        params: Fp16Params,
    ) -> Result<Self, QLinearError> {
        assert_eq!(
            src.len(),
            nrows * ncols,
            "Source length {} does not match [{}, {}]",
            src.len(),
            nrows,
            ncols
        );
        let len = padded_len(
            BackendKind::Fp16,
            &[ncols.div_ceil(params.block_cols), params.block_cols, nrows],
        )?;
        let mut packed = Self {
            nrows,
            ncols,
            block_cols: params.block_cols,
            data: try_alloc(len, f16::ZERO, TensorDtype::F16)?,
        };
        let mut saturated = 0usize;
        for r in 0..nrows {
            for c in 0..ncols {
                let v = match op {
                    MatrixOp::NoTranspose => src[r * ncols + c],
                    MatrixOp::Transpose => src[c * nrows + r],
                };
                let (h, clamped) = saturating_f16(v);
                saturated += clamped as usize;
                let off = packed.offset(r, c);
                packed.data[off] = h;
            }
        }
        if saturated > 0 {
            warn!(
                saturated,
                total = nrows * ncols,
                "Weight values outside the float16 range were clamped"
            );
        }
        debug!(nrows, ncols, block_cols = params.block_cols, "Packed fp16 matrix");
        Ok(packed)
    }

    fn offset(&self, r: usize, c: usize) -> usize {
        (c / self.block_cols) * self.nrows * self.block_cols + r * self.block_cols + c % self.block_cols
    }

    /// K, the number of input features.
    pub fn num_rows(&self) -> usize {
        self.nrows
    }

    /// N, the number of output features.
    pub fn num_cols(&self) -> usize {
        self.ncols
    }

    /// Write the matrix into `out` as raw f16 bits, oriented by `op`.
    ///
    /// # Panics
    /// Panics if `out.len() != nrows * ncols`.
    pub fn unpack_into(&self, out: &mut [u16], op: MatrixOp) {
        assert_eq!(
            out.len(),
            self.nrows * self.ncols,
            "Output length {} does not match [{}, {}]",
            out.len(),
            self.nrows,
            self.ncols
        );
        for r in 0..self.nrows {
            for c in 0..self.ncols {
                let dst = match op {
                    MatrixOp::NoTranspose => r * self.ncols + c,
                    MatrixOp::Transpose => c * self.nrows + r,
                };
                out[dst] = self.data[self.offset(r, c)].to_bits();
            }
        }
    }
}

/// Float weight packed as float16. Carries no quantization metadata.
#[derive(Debug, Clone)]
pub struct PackedLinearWeightFp16 {
    w: PackedGemmMatrixFp16,
    bias: Option<Bias>,
}

impl PackedLinearWeightFp16 {
    /// Pack an F32 `[N, K]` weight.
    pub fn prepack(
        weight: &Tensor,
        bias: Option<Bias>,
        params: &Fp16Params,
    ) -> Result<Self, QLinearError> {
        if weight.dtype() != TensorDtype::F32 {
            return Err(QLinearError::DtypeMismatch {
                expected: TensorDtype::F32,
                actual: weight.dtype(),
            });
        }
        let (n, k) = weight.dims_2d()?;
        check_bias(bias.as_ref(), n)?;
        let w = PackedGemmMatrixFp16::pack(MatrixOp::Transpose, k, n, weight.as_f32(), *params)?;
        Ok(Self { w, bias })
    }

    pub fn from_raw_parts(w: PackedGemmMatrixFp16, bias: Option<Bias>) -> Self {
        Self { w, bias }
    }

    pub fn packed_matrix(&self) -> &PackedGemmMatrixFp16 {
        &self.w
    }
}

impl LinearPackedParams for PackedLinearWeightFp16 {
    fn unpack(&self) -> Result<UnpackedWeight, QLinearError> {
        let nrows = self.w.num_rows();
        let ncols = self.w.num_cols();

        let mut unpacked = Tensor::try_empty_f16(&[ncols, nrows])?;
        self.w.unpack_into(unpacked.as_f16_bits_mut(), MatrixOp::Transpose);
        Ok((Arc::new(unpacked.to_f32()?), self.bias.clone()))
    }

    fn bias(&self) -> Option<Bias> {
        self.bias.clone()
    }

    fn output_features(&self) -> usize {
        self.w.num_cols()
    }

    fn input_features(&self) -> usize {
        self.w.num_rows()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Fp16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_scenario() {
        // Packed buffer is logically [K=2, N=3] = [[1, 2, 3], [4, 5, 6]].
        let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let m = PackedGemmMatrixFp16::pack(MatrixOp::NoTranspose, 2, 3, &src, Fp16Params::default())
            .unwrap();
        let packed = PackedLinearWeightFp16::from_raw_parts(m, None);
        let (dense, bias) = packed.unpack().unwrap();
        assert_eq!(dense.dtype(), TensorDtype::F32);
        assert_eq!(dense.shape(), &[3, 2]);
        assert_eq!(dense.as_f32(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(bias.is_none());
    }

    #[test]
    fn test_transpose_exact_elementwise() {
        let (k, n) = (5, 7);
        let m_vals: Vec<f32> = (0..k * n).map(|i| i as f32 * 0.125 - 3.0).collect();
        let m = PackedGemmMatrixFp16::pack(
            MatrixOp::NoTranspose,
            k,
            n,
            &m_vals,
            Fp16Params { block_cols: 3 },
        )
        .unwrap();
        let (dense, _) = PackedLinearWeightFp16::from_raw_parts(m, None).unpack().unwrap();
        for i in 0..n {
            for j in 0..k {
                let expected = f16::from_f32(m_vals[j * n + i]).to_f32();
                assert_eq!(dense.as_f32()[i * k + j], expected, "position [{}][{}]", i, j);
            }
        }
    }

    #[test]
    fn test_no_transpose_unpack() {
        let src = [1.0, 2.0, 3.0, 4.0];
        let m = PackedGemmMatrixFp16::pack(MatrixOp::NoTranspose, 2, 2, &src, Fp16Params { block_cols: 1 })
            .unwrap();
        let mut out = vec![0u16; 4];
        m.unpack_into(&mut out, MatrixOp::NoTranspose);
        let vals: Vec<f32> = out.iter().map(|&b| f16::from_bits(b).to_f32()).collect();
        assert_eq!(vals, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_prepack_round_trip() {
        let weight = Tensor::new(vec![3, 4], (0..12).map(|i| i as f32 - 6.5).collect());
        let packed = PackedLinearWeightFp16::prepack(&weight, None, &Fp16Params { block_cols: 2 })
            .unwrap();
        assert_eq!(packed.output_features(), 3);
        assert_eq!(packed.input_features(), 4);
        let (dense, _) = packed.unpack().unwrap();
        assert_eq!(*dense, weight);

        let repacked =
            PackedLinearWeightFp16::prepack(&dense, None, &Fp16Params { block_cols: 2 }).unwrap();
        assert_eq!(repacked.packed_matrix(), packed.packed_matrix());
    }

    #[test]
    fn test_out_of_range_values_saturate() {
        let weight = Tensor::new(vec![1, 3], vec![1.0e6, -1.0e6, 1.0]);
        let packed = PackedLinearWeightFp16::prepack(&weight, None, &Fp16Params::default()).unwrap();
        let (dense, _) = packed.unpack().unwrap();
        assert_eq!(dense.as_f32(), &[65504.0, -65504.0, 1.0]);
    }

    #[test]
    fn test_pack_overflowing_panel_width() {
        let params = Fp16Params { block_cols: usize::MAX };
        let result = PackedGemmMatrixFp16::pack(MatrixOp::NoTranspose, 2, 1, &[1.0, 2.0], params);
        assert!(matches!(result, Err(QLinearError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_quantized_weight() {
        let weight = Tensor::from_qint8(
            vec![1, 1],
            vec![1],
            crate::tensor::Quantizer::per_tensor(1.0, 0),
        )
        .unwrap();
        let result = PackedLinearWeightFp16::prepack(&weight, None, &Fp16Params::default());
        assert!(matches!(result, Err(QLinearError::DtypeMismatch { .. })));
    }

    #[test]
    fn test_bias_returned() {
        let weight = Tensor::new(vec![2, 1], vec![1.0, 2.0]);
        let bias: Bias = Arc::from(vec![3.0f32, 4.0]);
        let packed =
            PackedLinearWeightFp16::prepack(&weight, Some(Arc::clone(&bias)), &Fp16Params::default())
                .unwrap();
        assert!(Arc::ptr_eq(&packed.bias().unwrap(), &bias));
        assert!(Arc::ptr_eq(&packed.unpack().unwrap().1.unwrap(), &bias));
    }
}
