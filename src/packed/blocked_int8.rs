//! Blocked int8 layout (per-tensor or per-channel affine).
//!
//! The packed matrix is the `B` operand of `C = A · B`: logical shape `[K rows, N cols]`,
//! so its columns are the weight's output features and its rows the input features.
//! `B` is cut into `block_rows × block_cols` tiles, stored tile after tile in row-tile
//! major order. Inside a tile, `row_interleave` consecutive rows of the same column sit
//! next to each other so the kernel can load them with one instruction:
//!
//! ```text
//! offset(r, c) = (r / ri) * block_cols * ri + c * ri + r % ri
//! ```
//!
//! Tiles on the right and bottom edges are zero padded to full size.

use std::sync::Arc;

use tracing::debug;

use crate::config::BlockedInt8Params;
use crate::error::QLinearError;
use crate::packed::{
    check_bias, padded_len, BackendKind, Bias, LinearPackedParams, UnpackedWeight,
};
use crate::tensor::{try_alloc, QScheme, Quantizer, Tensor, TensorDtype};

/// Tiled, row-interleaved int8 matrix of logical shape `[nrows, ncols]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedInt8Matrix {
    nrows: usize,
    ncols: usize,
    params: BlockedInt8Params,
    data: Vec<i8>,
}

impl BlockedInt8Matrix {
    /// Pack a row-major `[n, k]` weight as the `[k, n]` matrix `B = Wᵀ`.
    ///
    /// # Panics
    /// Panics if `weight.len() != n * k`.
    pub fn pack(
        weight: &[i8],
        n: usize,
        k: usize,
        params: BlockedInt8Params,
    ) -> Result<Self, QLinearError> {
        assert_eq!(
            weight.len(),
            n * k,
            "Weight length {} does not match [{}, {}]",
            weight.len(),
            n,
            k
        );
        let len = Self::packed_len_for(k, n, &params)?;
        let mut packed = Self {
            nrows: k,
            ncols: n,
            params,
            data: try_alloc(len, 0i8, TensorDtype::QInt8)?,
        };
        for row in 0..k {
            for col in 0..n {
                let off = packed.offset(row, col);
                packed.data[off] = weight[col * k + row];
            }
        }
        debug!(k, n, ?params, packed_len = len, "Packed blocked int8 matrix");
        Ok(packed)
    }

    /// Number of logical rows (K, input features).
    pub fn num_rows(&self) -> usize {
        self.nrows
    }

    /// Number of logical columns (N, output features).
    pub fn num_cols(&self) -> usize {
        self.ncols
    }

    /// Length of the padded packed buffer.
    pub fn packed_len(&self) -> usize {
        self.data.len()
    }

    fn packed_len_for(
        nrows: usize,
        ncols: usize,
        p: &BlockedInt8Params,
    ) -> Result<usize, QLinearError> {
        let row_tiles = nrows.div_ceil(p.block_rows);
        let col_tiles = ncols.div_ceil(p.block_cols);
        padded_len(
            BackendKind::BlockedInt8,
            &[row_tiles, col_tiles, p.block_rows, p.block_cols],
        )
    }

    fn offset(&self, row: usize, col: usize) -> usize {
        let p = &self.params;
        let col_tiles = self.ncols.div_ceil(p.block_cols);
        let tile = (row / p.block_rows) * col_tiles + col / p.block_cols;
        let r = row % p.block_rows;
        let c = col % p.block_cols;
        tile * p.block_rows * p.block_cols
            + (r / p.row_interleave) * p.block_cols * p.row_interleave
            + c * p.row_interleave
            + r % p.row_interleave
    }

    /// Scatter the tiles into `out` as row-major `[ncols, nrows]` (that is `[N, K]`).
    ///
    /// # Panics
    /// Panics if `out.len() != nrows * ncols`.
    pub fn unpack_into(&self, out: &mut [i8]) {
        assert_eq!(
            out.len(),
            self.nrows * self.ncols,
            "Output length {} does not match [{}, {}]",
            out.len(),
            self.ncols,
            self.nrows
        );
        for row in 0..self.nrows {
            for col in 0..self.ncols {
                out[col * self.nrows + row] = self.data[self.offset(row, col)];
            }
        }
    }
}

/// Int8 weight packed in the blocked layout, with its affine quantization parameters.
#[derive(Debug, Clone)]
pub struct PackedLinearWeightInt8 {
    w: BlockedInt8Matrix,
    bias: Option<Bias>,
    w_scale: Vec<f64>,
    w_zp: Vec<i64>,
    q_scheme: QScheme,
}

impl PackedLinearWeightInt8 {
    /// Pack a QInt8 `[N, K]` weight quantized per-tensor or per-channel along axis 0.
    pub fn prepack(
        weight: &Tensor,
        bias: Option<Bias>,
        params: &BlockedInt8Params,
    ) -> Result<Self, QLinearError> {
        if weight.dtype() != TensorDtype::QInt8 {
            return Err(QLinearError::DtypeMismatch {
                expected: TensorDtype::QInt8,
                actual: weight.dtype(),
            });
        }
        let (n, k) = weight.dims_2d()?;
        check_bias(bias.as_ref(), n)?;

        let (w_scale, w_zp, q_scheme) = match weight.quantizer() {
            Some(Quantizer::PerTensorAffine { scale, zero_point }) => {
                (vec![*scale], vec![*zero_point], QScheme::PerTensorAffine)
            }
            Some(Quantizer::PerChannelAffine {
                scales,
                zero_points,
                axis: 0,
            }) => (scales.clone(), zero_points.clone(), QScheme::PerChannelAffine),
            Some(q) => {
                return Err(QLinearError::UnsupportedScheme {
                    backend: BackendKind::BlockedInt8,
                    scheme: q.qscheme(),
                })
            }
            None => unreachable!("QInt8 tensor must carry a quantizer"),
        };

        let w = BlockedInt8Matrix::pack(weight.as_i8(), n, k, *params)?;
        Ok(Self {
            w,
            bias,
            w_scale,
            w_zp,
            q_scheme,
        })
    }

    /// Assemble a packed weight from parts produced elsewhere.
    ///
    /// No validation happens here; a bad scheme tag or parameter arrays surface from
    /// [`LinearPackedParams::unpack`].
    pub fn from_raw_parts(
        w: BlockedInt8Matrix,
        bias: Option<Bias>,
        w_scale: Vec<f64>,
        w_zp: Vec<i64>,
        q_scheme: QScheme,
    ) -> Self {
        Self {
            w,
            bias,
            w_scale,
            w_zp,
            q_scheme,
        }
    }

    pub fn packed_matrix(&self) -> &BlockedInt8Matrix {
        &self.w
    }

    pub fn q_scheme(&self) -> QScheme {
        self.q_scheme
    }

    fn per_tensor_params(&self) -> Result<(f64, i64), QLinearError> {
        match (self.w_scale.first(), self.w_zp.first()) {
            (Some(&scale), Some(&zp)) => Ok((scale, zp)),
            _ => Err(QLinearError::ShapeMismatch {
                expected: vec![1],
                actual: vec![self.w_scale.len().min(self.w_zp.len())],
            }),
        }
    }
}

impl LinearPackedParams for PackedLinearWeightInt8 {
    fn unpack(&self) -> Result<UnpackedWeight, QLinearError> {
        // Packed columns are output features, packed rows input features.
        let n = self.w.num_cols();
        let k = self.w.num_rows();

        let quantizer = match self.q_scheme {
            QScheme::PerTensorAffine => {
                let (scale, zero_point) = self.per_tensor_params()?;
                Quantizer::per_tensor(scale, zero_point)
            }
            QScheme::PerChannelAffine => {
                Quantizer::per_channel(self.w_scale.clone(), self.w_zp.clone(), 0)
            }
            other => return Err(QLinearError::MalformedScheme(other)),
        };

        let mut weight = Tensor::try_empty_quantized(&[n, k], quantizer)?;
        self.w.unpack_into(weight.as_i8_mut());
        Ok((Arc::new(weight), self.bias.clone()))
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
        BackendKind::BlockedInt8
    }
}
