//! Shared CLI utilities for the strata-qlinear binary tools.

pub mod backend;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QLinearError;
use crate::packed::{BackendKind, Bias, DenseWeight, UnpackedWeight};
use crate::tensor::{QScheme, Quantizer, Tensor, TensorStorage};

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Dense weight as described in a JSON input file.
///
/// Without `scheme` the values are F32; with one they must be int8 integers.
#[derive(Debug, Deserialize)]
pub struct WeightFile {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
    #[serde(default)]
    pub scheme: Option<QScheme>,
    #[serde(default)]
    pub scales: Vec<f64>,
    #[serde(default)]
    pub zero_points: Vec<i64>,
    #[serde(default)]
    pub bias: Option<Vec<f32>>,
}

impl WeightFile {
    /// Build the dense weight and bias this file describes.
    pub fn into_weight(self) -> Result<(DenseWeight, Option<Bias>), QLinearError> {
        let shape = vec![self.rows, self.cols];
        let n_elements = self.rows.checked_mul(self.cols).ok_or_else(|| {
            QLinearError::InvalidWeightFile(format!(
                "{} x {} elements overflows usize",
                self.rows, self.cols
            ))
        })?;
        if self.values.len() != n_elements {
            return Err(QLinearError::ShapeMismatch {
                expected: shape,
                actual: vec![self.values.len()],
            });
        }

        let tensor = match self.scheme {
            None => Tensor::new(shape, self.values.iter().map(|&v| v as f32).collect()),
            Some(scheme) => {
                let quantizer = match scheme {
                    QScheme::PerTensorAffine => match (&self.scales[..], &self.zero_points[..]) {
                        (&[scale], &[zero_point]) => Quantizer::per_tensor(scale, zero_point),
                        _ => {
                            return Err(QLinearError::InvalidWeightFile(format!(
                                "per_tensor_affine needs exactly one scale and zero point, got {} and {}",
                                self.scales.len(),
                                self.zero_points.len()
                            )))
                        }
                    },
                    QScheme::PerChannelAffine => {
                        Quantizer::per_channel(self.scales, self.zero_points, 0)
                    }
                    other => return Err(QLinearError::MalformedScheme(other)),
                };
                let values = self
                    .values
                    .iter()
                    .map(|&v| to_qint8(v))
                    .collect::<Result<Vec<i8>, _>>()?;
                Tensor::from_qint8(shape, values, quantizer)?
            }
        };

        Ok((Arc::new(tensor), self.bias.map(Arc::from)))
    }
}

fn to_qint8(v: f64) -> Result<i8, QLinearError> {
    if v.fract() != 0.0 || v < i8::MIN as f64 || v > i8::MAX as f64 {
        return Err(QLinearError::InvalidWeightFile(format!(
            "value {} is not an int8 integer",
            v
        )));
    }
    Ok(v as i8)
}

/// Read a [`WeightFile`] from disk and build its weight and bias.
pub fn load_weight_file(path: &Path) -> Result<(DenseWeight, Option<Bias>), QLinearError> {
    let text = std::fs::read_to_string(path)?;
    let file: WeightFile = serde_json::from_str(&text)?;
    file.into_weight()
}

/// Serializable summary of an unpacked weight.
#[derive(Debug, Serialize)]
pub struct UnpackReport {
    pub backend: BackendKind,
    pub shape: Vec<usize>,
    pub dtype: String,
    pub qscheme: Option<QScheme>,
    pub scales: Vec<f64>,
    pub zero_points: Vec<i64>,
    pub values: Vec<f64>,
    pub bias: Option<Vec<f32>>,
    pub round_trip: bool,
}

impl UnpackReport {
    pub fn new(backend: BackendKind, unpacked: &UnpackedWeight, round_trip: bool) -> Self {
        let (weight, bias) = unpacked;
        let values = match weight.storage() {
            TensorStorage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::F16(v) => v
                .iter()
                .map(|&b| half::f16::from_bits(b).to_f32() as f64)
                .collect(),
            TensorStorage::I8(v) => v.iter().map(|&x| x as f64).collect(),
        };
        let (scales, zero_points) = match weight.quantizer() {
            Some(Quantizer::PerTensorAffine { scale, zero_point }) => {
                (vec![*scale], vec![*zero_point])
            }
            Some(Quantizer::PerChannelAffine {
                scales,
                zero_points,
                ..
            }) => (scales.clone(), zero_points.clone()),
            None => (Vec::new(), Vec::new()),
        };
        Self {
            backend,
            shape: weight.shape().to_vec(),
            dtype: format!("{:?}", weight.dtype()),
            qscheme: weight.qscheme(),
            scales,
            zero_points,
            values,
            bias: bias.as_ref().map(|b| b.to_vec()),
            round_trip,
        }
    }

    /// Human-readable rendering, one matrix row per line.
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "backend: {}\nshape: {:?}\ndtype: {}\n",
            self.backend, self.shape, self.dtype
        );
        if let Some(scheme) = self.qscheme {
            out.push_str(&format!(
                "qscheme: {:?}\nscales: {:?}\nzero_points: {:?}\n",
                scheme, self.scales, self.zero_points
            ));
        }
        let cols = self.shape.get(1).copied().unwrap_or(1).max(1);
        for row in self.values.chunks(cols) {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&format!("[{}]\n", cells.join(", ")));
        }
        if let Some(bias) = &self.bias {
            out.push_str(&format!("bias: {:?}\n", bias));
        }
        out.push_str(&format!("round_trip: {}\n", if self.round_trip { "ok" } else { "MISMATCH" }));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorDtype;

    fn parse(json: &str) -> Result<(DenseWeight, Option<Bias>), QLinearError> {
        serde_json::from_str::<WeightFile>(json).unwrap().into_weight()
    }

    #[test]
    fn test_float_weight_file() {
        let (w, b) = parse(r#"{"rows": 1, "cols": 2, "values": [0.5, -1.0]}"#).unwrap();
        assert_eq!(w.dtype(), TensorDtype::F32);
        assert_eq!(w.as_f32(), &[0.5, -1.0]);
        assert!(b.is_none());
    }

    #[test]
    fn test_per_tensor_weight_file() {
        let (w, b) = parse(
            r#"{"rows": 2, "cols": 1, "values": [3, -4], "scheme": "per_tensor_affine",
                "scales": [0.5], "zero_points": [1], "bias": [0.1, 0.2]}"#,
        )
        .unwrap();
        assert_eq!(w.as_i8(), &[3, -4]);
        assert_eq!(w.quantizer(), Some(&Quantizer::per_tensor(0.5, 1)));
        assert_eq!(&*b.unwrap(), &[0.1f32, 0.2]);
    }

    #[test]
    fn test_per_channel_weight_file() {
        let (w, _) = parse(
            r#"{"rows": 2, "cols": 1, "values": [1, 2], "scheme": "per_channel_affine",
                "scales": [0.5, 0.25], "zero_points": [0, 1]}"#,
        )
        .unwrap();
        assert_eq!(w.qscheme(), Some(QScheme::PerChannelAffine));
    }

    #[test]
    fn test_value_count_mismatch() {
        let result = parse(r#"{"rows": 2, "cols": 2, "values": [1.0]}"#);
        assert!(matches!(result, Err(QLinearError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_overflowing_dimensions() {
        let json = format!(r#"{{"rows": {}, "cols": 2, "values": []}}"#, usize::MAX);
        let result = parse(&json);
        assert!(matches!(result, Err(QLinearError::InvalidWeightFile(_))));
    }

    #[test]
    fn test_non_integer_quantized_value() {
        let result = parse(
            r#"{"rows": 1, "cols": 1, "values": [1.5], "scheme": "per_tensor_affine",
                "scales": [1.0], "zero_points": [0]}"#,
        );
        assert!(matches!(result, Err(QLinearError::InvalidWeightFile(_))));
    }

    #[test]
    fn test_out_of_range_quantized_value() {
        let result = parse(
            r#"{"rows": 1, "cols": 1, "values": [200], "scheme": "per_tensor_affine",
                "scales": [1.0], "zero_points": [0]}"#,
        );
        assert!(matches!(result, Err(QLinearError::InvalidWeightFile(_))));
    }

    #[test]
    fn test_symmetric_scheme_rejected() {
        let result = parse(
            r#"{"rows": 1, "cols": 1, "values": [1], "scheme": "per_tensor_symmetric",
                "scales": [1.0], "zero_points": [0]}"#,
        );
        assert!(matches!(
            result,
            Err(QLinearError::MalformedScheme(QScheme::PerTensorSymmetric))
        ));
    }

    #[test]
    fn test_load_weight_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weight.json");
        std::fs::write(&path, r#"{"rows": 1, "cols": 1, "values": [2.0]}"#).unwrap();
        let (w, _) = load_weight_file(&path).unwrap();
        assert_eq!(w.as_f32(), &[2.0]);
    }

    #[test]
    fn test_load_weight_file_missing() {
        let result = load_weight_file(Path::new("/nonexistent/weight.json"));
        assert!(matches!(result, Err(QLinearError::Io(_))));
    }

    #[test]
    fn test_report_text() {
        let weight = Arc::new(
            Tensor::from_qint8(vec![2, 2], vec![1, 2, 3, 4], Quantizer::per_tensor(0.5, 0))
                .unwrap(),
        );
        let report = UnpackReport::new(BackendKind::BlockedInt8, &(weight, None), true);
        let text = report.to_text();
        assert!(text.contains("backend: blocked-int8"), "{}", text);
        assert!(text.contains("[1, 2]\n[3, 4]"), "{}", text);
        assert!(text.contains("round_trip: ok"), "{}", text);
    }

    #[test]
    fn test_report_json() {
        let weight = Arc::new(Tensor::new(vec![1, 2], vec![1.0, 2.0]));
        let bias: Bias = Arc::from(vec![0.5f32]);
        let report = UnpackReport::new(BackendKind::Fp16, &(weight, Some(bias)), true);
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["backend"], "fp16");
        assert_eq!(json["shape"], serde_json::json!([1, 2]));
        assert_eq!(json["qscheme"], serde_json::Value::Null);
        assert_eq!(json["bias"], serde_json::json!([0.5]));
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        init_logging(true);
    }
}
