//! Packing configuration: tile geometry for each backend layout.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::QLinearError;

/// Tile geometry for the blocked int8 layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlockedInt8Params {
    /// Rows (input features) per tile.
    pub block_rows: usize,
    /// Columns (output features) per tile.
    pub block_cols: usize,
    /// Consecutive rows stored adjacently for one column inside a tile.
    pub row_interleave: usize,
}

impl Default for BlockedInt8Params {
    fn default() -> Self {
        Self {
            block_rows: 64,
            block_cols: 32,
            row_interleave: 4,
        }
    }
}

/// Panel geometry for the q8gemm layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Q8GemmParams {
    /// Output channels per panel.
    pub nr: usize,
    /// Input channels per inner k-block.
    pub kr: usize,
}

impl Default for Q8GemmParams {
    fn default() -> Self {
        Self { nr: 8, kr: 1 }
    }
}

/// Panel geometry for the fp16 layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Fp16Params {
    /// Columns (output features) per panel.
    pub block_cols: usize,
}

impl Default for Fp16Params {
    fn default() -> Self {
        Self { block_cols: 16 }
    }
}

/// Configuration for packing dense weights into backend layouts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    pub blocked_int8: BlockedInt8Params,
    pub q8gemm: Q8GemmParams,
    pub fp16: Fp16Params,
    /// Keep the original dense tensor alongside the q8gemm layout.
    pub retain_original: bool,
}

impl PackingConfig {
    /// Load a config from a JSON file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, QLinearError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        info!(path = %path.display(), "Loaded packing config");
        Ok(config)
    }

    /// Parse a config from a JSON string and validate it.
    pub fn from_json(text: &str) -> Result<Self, QLinearError> {
        let config: PackingConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject geometries that cannot describe a layout.
    pub fn validate(&self) -> Result<(), QLinearError> {
        let b = &self.blocked_int8;
        if b.block_rows == 0 || b.block_cols == 0 || b.row_interleave == 0 {
            return Err(QLinearError::InvalidConfig(format!(
                "blocked_int8 sizes must be non-zero, got {:?}",
                b
            )));
        }
        if b.block_rows % b.row_interleave != 0 {
            return Err(QLinearError::InvalidConfig(format!(
                "blocked_int8.block_rows ({}) must be a multiple of row_interleave ({})",
                b.block_rows, b.row_interleave
            )));
        }
        if self.q8gemm.nr == 0 || self.q8gemm.kr == 0 {
            return Err(QLinearError::InvalidConfig(format!(
                "q8gemm nr/kr must be non-zero, got {:?}",
                self.q8gemm
            )));
        }
        if self.fp16.block_cols == 0 {
            return Err(QLinearError::InvalidConfig(
                "fp16.block_cols must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
