//! Canonical dense tensor produced by unpacking.
//!
//! Provides the [`Tensor`] type returned from every packed-weight backend. Supports F32,
//! F16 (raw IEEE half bits), and QInt8 storage. QInt8 tensors always carry a
//! [`Quantizer`]; the other dtypes never do.

mod quantizer;

pub use quantizer::{QScheme, Quantizer};

use tracing::debug;

use crate::error::QLinearError;

/// Data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorDtype {
    F32,
    F16,
    QInt8,
}

impl TensorDtype {
    /// Size in bytes of one element.
    pub fn element_size(&self) -> usize {
        match self {
            TensorDtype::F32 => 4,
            TensorDtype::F16 => 2,
            TensorDtype::QInt8 => 1,
        }
    }
}

/// Storage for tensor data, varying by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    /// 32-bit floating point values.
    F32(Vec<f32>),
    /// 16-bit floating point values stored as raw u16 bits.
    F16(Vec<u16>),
    /// Signed 8-bit quantized values.
    I8(Vec<i8>),
}

/// Row-major N-dimensional tensor with dtype, storage and optional quantizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: TensorDtype,
    storage: TensorStorage,
    quantizer: Option<Quantizer>,
}

/// Compute row-major strides from shape.
/// strides[i] = product of shape[i+1..]
fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    if shape.is_empty() {
        return strides;
    }
    strides[shape.len() - 1] = 1;
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Allocate `n` copies of `fill`, reporting allocator failure instead of aborting.
pub(crate) fn try_alloc<T: Clone>(
    n: usize,
    fill: T,
    dtype: TensorDtype,
) -> Result<Vec<T>, QLinearError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(n)
        .map_err(|_| QLinearError::AllocationFailed { elements: n, dtype })?;
    buf.resize(n, fill);
    Ok(buf)
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "Data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        let strides = compute_strides(&shape);
        debug!(dtype = ?TensorDtype::F32, ?shape, "Created tensor");
        Self {
            shape,
            strides,
            dtype: TensorDtype::F32,
            storage: TensorStorage::F32(data),
            quantizer: None,
        }
    }

    /// Create an F16 tensor from shape and raw u16 bit data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_f16(shape: Vec<usize>, data: Vec<u16>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "F16 data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        let strides = compute_strides(&shape);
        debug!(dtype = ?TensorDtype::F16, ?shape, "Created tensor");
        Self {
            shape,
            strides,
            dtype: TensorDtype::F16,
            storage: TensorStorage::F16(data),
            quantizer: None,
        }
    }

    /// Create a QInt8 tensor tagged with `quantizer`.
    ///
    /// Returns `ShapeMismatch` if per-channel parameter arrays don't match the
    /// channel dimension.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_qint8(
        shape: Vec<usize>,
        data: Vec<i8>,
        quantizer: Quantizer,
    ) -> Result<Self, QLinearError> {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "QInt8 data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        quantizer.validate(&shape)?;
        let strides = compute_strides(&shape);
        debug!(dtype = ?TensorDtype::QInt8, ?shape, qscheme = ?quantizer.qscheme(), "Created tensor");
        Ok(Self {
            shape,
            strides,
            dtype: TensorDtype::QInt8,
            storage: TensorStorage::I8(data),
            quantizer: Some(quantizer),
        })
    }

    /// Allocate a zeroed QInt8 tensor carrying `quantizer`, ready to be filled
    /// through [`Tensor::as_i8_mut`].
    pub fn try_empty_quantized(shape: &[usize], quantizer: Quantizer) -> Result<Self, QLinearError> {
        let n_elements: usize = shape.iter().product();
        let data = try_alloc(n_elements, 0i8, TensorDtype::QInt8)?;
        Self::from_qint8(shape.to_vec(), data, quantizer)
    }

    /// Allocate a zeroed F16 tensor, ready to be filled through
    /// [`Tensor::as_f16_bits_mut`].
    pub fn try_empty_f16(shape: &[usize]) -> Result<Self, QLinearError> {
        let n_elements: usize = shape.iter().product();
        let data = try_alloc(n_elements, 0u16, TensorDtype::F16)?;
        Ok(Self::from_f16(shape.to_vec(), data))
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Returns the data type of the tensor.
    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    /// Returns the storage of the tensor.
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Returns the quantization parameters (QInt8 tensors only).
    pub fn quantizer(&self) -> Option<&Quantizer> {
        self.quantizer.as_ref()
    }

    /// Returns the quantization scheme tag (QInt8 tensors only).
    pub fn qscheme(&self) -> Option<QScheme> {
        self.quantizer.as_ref().map(Quantizer::qscheme)
    }

    /// Returns the total number of elements in the tensor.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns a reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Returns a reference to the raw F16 bits.
    ///
    /// # Panics
    /// Panics if the tensor is not F16 dtype.
    pub fn as_f16_bits(&self) -> &[u16] {
        match &self.storage {
            TensorStorage::F16(data) => data,
            _ => panic!("Tensor is {:?}, not F16", self.dtype),
        }
    }

    /// Mutable access to the raw F16 bits.
    ///
    /// # Panics
    /// Panics if the tensor is not F16 dtype.
    pub fn as_f16_bits_mut(&mut self) -> &mut [u16] {
        match &mut self.storage {
            TensorStorage::F16(data) => data,
            _ => panic!("Tensor is {:?}, not F16", self.dtype),
        }
    }

    /// Returns a reference to the quantized int8 values.
    ///
    /// # Panics
    /// Panics if the tensor is not QInt8 dtype.
    pub fn as_i8(&self) -> &[i8] {
        match &self.storage {
            TensorStorage::I8(data) => data,
            _ => panic!("Tensor is {:?}, not QInt8", self.dtype),
        }
    }

    /// Mutable access to the quantized int8 values.
    ///
    /// # Panics
    /// Panics if the tensor is not QInt8 dtype.
    pub fn as_i8_mut(&mut self) -> &mut [i8] {
        match &mut self.storage {
            TensorStorage::I8(data) => data,
            _ => panic!("Tensor is {:?}, not QInt8", self.dtype),
        }
    }

    /// Widen the tensor to F32.
    ///
    /// - F32 tensors are cloned as-is.
    /// - F16 tensors are converted element-wise using the `half` crate.
    /// - QInt8 tensors are rejected: widening them would require dequantization.
    pub fn to_f32(&self) -> Result<Tensor, QLinearError> {
        match &self.storage {
            TensorStorage::F32(_) => Ok(self.clone()),
            TensorStorage::F16(bits) => {
                let mut data = try_alloc(bits.len(), 0.0f32, TensorDtype::F32)?;
                for (dst, &b) in data.iter_mut().zip(bits.iter()) {
                    *dst = half::f16::from_bits(b).to_f32();
                }
                Ok(Tensor {
                    shape: self.shape.clone(),
                    strides: self.strides.clone(),
                    dtype: TensorDtype::F32,
                    storage: TensorStorage::F32(data),
                    quantizer: None,
                })
            }
            TensorStorage::I8(_) => Err(QLinearError::DtypeMismatch {
                expected: TensorDtype::F16,
                actual: self.dtype,
            }),
        }
    }

    /// Returns the number of rows (first dimension) for a 2D tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not 2D.
    pub fn rows(&self) -> usize {
        assert_eq!(
            self.shape.len(),
            2,
            "rows() requires a 2D tensor, got shape {:?}",
            self.shape
        );
        self.shape[0]
    }

    /// Returns the number of columns (second dimension) for a 2D tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not 2D.
    pub fn cols(&self) -> usize {
        assert_eq!(
            self.shape.len(),
            2,
            "cols() requires a 2D tensor, got shape {:?}",
            self.shape
        );
        self.shape[1]
    }

    /// Returns `(rows, cols)` or `ShapeMismatch` if the tensor is not 2D.
    pub fn dims_2d(&self) -> Result<(usize, usize), QLinearError> {
        match self.shape.as_slice() {
            &[rows, cols] => Ok((rows, cols)),
            other => Err(QLinearError::ShapeMismatch {
                expected: vec![0, 0],
                actual: other.to_vec(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[3, 5]), vec![5, 1]);
        assert_eq!(compute_strides(&[10]), vec![1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_new_f32_tensor() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), TensorDtype::F32);
        assert_eq!(t.n_elements(), 6);
        assert_eq!(t.strides(), &[3, 1]);
        assert_eq!(t.as_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(t.quantizer().is_none());
    }

    #[test]
    #[should_panic(expected = "Data length")]
    fn test_new_shape_mismatch() {
        Tensor::new(vec![2, 3], vec![1.0, 2.0]);
    }

    #[test]
    fn test_from_qint8_per_tensor() {
        let t = Tensor::from_qint8(
            vec![2, 2],
            vec![1, -2, 3, -4],
            Quantizer::per_tensor(0.5, 3),
        )
        .unwrap();
        assert_eq!(t.dtype(), TensorDtype::QInt8);
        assert_eq!(t.as_i8(), &[1, -2, 3, -4]);
        assert_eq!(t.qscheme(), Some(QScheme::PerTensorAffine));
        assert_eq!(t.quantizer(), Some(&Quantizer::per_tensor(0.5, 3)));
    }

    #[test]
    fn test_from_qint8_per_channel_wrong_length() {
        let result = Tensor::from_qint8(
            vec![3, 2],
            vec![0; 6],
            Quantizer::per_channel(vec![1.0, 1.0], vec![0, 0], 0),
        );
        assert!(matches!(result, Err(QLinearError::ShapeMismatch { .. })));
    }

    #[test]
    #[should_panic(expected = "QInt8 data length")]
    fn test_from_qint8_data_mismatch() {
        let _ = Tensor::from_qint8(vec![2, 2], vec![0; 3], Quantizer::per_tensor(1.0, 0));
    }

    #[test]
    fn test_try_empty_quantized_is_zeroed() {
        let t = Tensor::try_empty_quantized(&[4, 5], Quantizer::per_tensor(0.1, 0)).unwrap();
        assert_eq!(t.shape(), &[4, 5]);
        assert!(t.as_i8().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_try_alloc_reports_failure() {
        let result = try_alloc(usize::MAX, 0u16, TensorDtype::F16);
        match result {
            Err(QLinearError::AllocationFailed { elements, dtype }) => {
                assert_eq!(elements, usize::MAX);
                assert_eq!(dtype, TensorDtype::F16);
            }
            other => panic!("Expected AllocationFailed, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_allocation_failure_reports_bytes() {
        let err = QLinearError::AllocationFailed {
            elements: 1024,
            dtype: TensorDtype::F32,
        };
        assert_eq!(err.to_string(), "Failed to allocate 1024 elements of F32 (4096 bytes)");
    }

    #[test]
    fn test_f16_to_f32() {
        let vals: Vec<f32> = vec![1.0, -0.5, 3.14, 0.0];
        let bits: Vec<u16> = vals.iter().map(|&v| half::f16::from_f32(v).to_bits()).collect();
        let t = Tensor::from_f16(vec![4], bits);
        let converted = t.to_f32().unwrap();
        assert_eq!(converted.dtype(), TensorDtype::F32);
        for (i, &expected) in vals.iter().enumerate() {
            let diff = (converted.as_f32()[i] - expected).abs();
            assert!(diff < 0.01, "F16 widen failed at {}: expected {}, got {}", i, expected, converted.as_f32()[i]);
        }
    }

    #[test]
    fn test_f16_widen_is_exact() {
        // Every finite f16 is exactly representable in f32.
        let h = half::f16::from_f32(0.1);
        let t = Tensor::from_f16(vec![1], vec![h.to_bits()]);
        assert_eq!(t.to_f32().unwrap().as_f32()[0], h.to_f32());
    }

    #[test]
    fn test_qint8_to_f32_rejected() {
        let t = Tensor::from_qint8(vec![1], vec![7], Quantizer::per_tensor(1.0, 0)).unwrap();
        assert!(matches!(t.to_f32(), Err(QLinearError::DtypeMismatch { .. })));
    }

    #[test]
    fn test_f32_to_f32_is_clone() {
        let t = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        assert_eq!(t.to_f32().unwrap(), t);
    }

    #[test]
    fn test_rows_cols() {
        let t = Tensor::new(vec![3, 5], vec![0.0; 15]);
        assert_eq!(t.rows(), 3);
        assert_eq!(t.cols(), 5);
        assert_eq!(t.dims_2d().unwrap(), (3, 5));
    }

    #[test]
    #[should_panic(expected = "rows() requires a 2D tensor")]
    fn test_rows_not_2d() {
        let t = Tensor::new(vec![3, 4, 5], vec![0.0; 60]);
        t.rows();
    }

    #[test]
    fn test_dims_2d_rejects_1d() {
        let t = Tensor::new(vec![3], vec![0.0; 3]);
        assert!(matches!(t.dims_2d(), Err(QLinearError::ShapeMismatch { .. })));
    }

    #[test]
    #[should_panic(expected = "not QInt8")]
    fn test_as_i8_wrong_type() {
        let t = Tensor::new(vec![1], vec![1.0]);
        t.as_i8();
    }

    #[test]
    fn test_equality_includes_quantizer() {
        let a = Tensor::from_qint8(vec![1], vec![1], Quantizer::per_tensor(1.0, 0)).unwrap();
        let b = Tensor::from_qint8(vec![1], vec![1], Quantizer::per_tensor(1.0, 1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_element_sizes() {
        assert_eq!(TensorDtype::F32.element_size(), 4);
        assert_eq!(TensorDtype::F16.element_size(), 2);
        assert_eq!(TensorDtype::QInt8.element_size(), 1);
    }
}
