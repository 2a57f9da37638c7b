//! Passthrough layout: the dense tensor is kept as-is.
//!
//! Used when the consuming kernel accepts the dense format directly. `unpack()` hands out
//! the retained `Arc`s, so callers share the instance the packed weight still relies on.

use std::sync::Arc;

use crate::error::QLinearError;
use crate::packed::{check_bias, BackendKind, Bias, DenseWeight, LinearPackedParams, UnpackedWeight};

#[derive(Debug, Clone)]
pub struct PackedLinearWeightsPassthrough {
    orig_weight: DenseWeight,
    orig_bias: Option<Bias>,
}

impl PackedLinearWeightsPassthrough {
    /// Retain a 2D `[N, K]` weight of any dtype.
    pub fn prepack(weight: DenseWeight, bias: Option<Bias>) -> Result<Self, QLinearError> {
        let (n, _) = weight.dims_2d()?;
        check_bias(bias.as_ref(), n)?;
        Ok(Self {
            orig_weight: weight,
            orig_bias: bias,
        })
    }
}

impl LinearPackedParams for PackedLinearWeightsPassthrough {
    fn unpack(&self) -> Result<UnpackedWeight, QLinearError> {
        Ok((Arc::clone(&self.orig_weight), self.orig_bias.clone()))
    }

    fn bias(&self) -> Option<Bias> {
        self.orig_bias.clone()
    }

    fn output_features(&self) -> usize {
        self.orig_weight.rows()
    }

    fn input_features(&self) -> usize {
        self.orig_weight.cols()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Passthrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Quantizer, Tensor};

    #[test]
    fn test_returns_same_instances() {
        let weight = Arc::new(
            Tensor::from_qint8(vec![2, 2], vec![1, 2, 3, 4], Quantizer::per_tensor(0.1, 2)).unwrap(),
        );
        let bias: Bias = Arc::from(vec![1.0f32, -1.0]);
        let packed =
            PackedLinearWeightsPassthrough::prepack(Arc::clone(&weight), Some(Arc::clone(&bias)))
                .unwrap();
        for _ in 0..3 {
            let (w, b) = packed.unpack().unwrap();
            assert!(Arc::ptr_eq(&w, &weight));
            assert!(Arc::ptr_eq(&b.unwrap(), &bias));
        }
    }

    #[test]
    fn test_float_weight_accepted() {
        let weight = Arc::new(Tensor::new(vec![1, 3], vec![0.5, 1.0, 1.5]));
        let packed = PackedLinearWeightsPassthrough::prepack(Arc::clone(&weight), None).unwrap();
        assert_eq!(packed.output_features(), 1);
        assert_eq!(packed.input_features(), 3);
        assert_eq!(*packed.unpack().unwrap().0, *weight);
    }

    #[test]
    fn test_rejects_non_2d() {
        let weight = Arc::new(Tensor::new(vec![4], vec![0.0; 4]));
        assert!(matches!(
            PackedLinearWeightsPassthrough::prepack(weight, None),
            Err(QLinearError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_shared_weight_cannot_be_mutated_in_place() {
        let weight = Arc::new(Tensor::new(vec![1, 1], vec![2.0]));
        let packed = PackedLinearWeightsPassthrough::prepack(Arc::clone(&weight), None).unwrap();
        let (mut w, _) = packed.unpack().unwrap();
        // Shared with the packed weight, so no exclusive access is handed out.
        assert!(Arc::get_mut(&mut w).is_none());
    }
}
