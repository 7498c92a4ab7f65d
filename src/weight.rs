//! Optional per-class loss weighting.
//!
//! A fixed table of non-negative scalars, one per foreground class, loaded
//! once at construction and immutable thereafter. A foreground sample with
//! label `l` (1-indexed) has its loss row multiplied by `table[l - 1] + 1.0`;
//! background samples keep a multiplier of exactly `1.0`.

use crate::error::{Error, Result};
use ndarray::Array1;
use std::fs;
use std::path::Path;

/// Immutable per-foreground-class weight table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeightTable {
    weights: Array1<f32>,
}

impl ClassWeightTable {
    /// Build a table from raw weights, rejecting negative or non-finite
    /// entries.
    pub fn from_vec(weights: Vec<f32>) -> Result<Self> {
        if let Some((index, &value)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "class weight at index {index} must be a non-negative finite number, got {value}"
            )));
        }
        Ok(Self {
            weights: Array1::from(weights),
        })
    }

    /// Load a table from a JSON array of non-negative numbers.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let weights: Vec<f32> = serde_json::from_str(&content).map_err(|e| {
            Error::Serialization(format!(
                "class weight table {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_vec(weights)
    }

    /// Number of foreground classes covered.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Raw weight for a zero-based foreground class index.
    pub fn get(&self, fg_index: usize) -> Option<f32> {
        self.weights.get(fg_index).copied()
    }

    /// Loss multiplier (`weight + 1.0`) for a zero-based foreground class
    /// index; out of range means the labels and the table disagree about the
    /// class set, which would silently corrupt training if ignored.
    pub fn multiplier(&self, fg_index: usize) -> Result<f32> {
        self.get(fg_index)
            .map(|w| w + 1.0)
            .ok_or(Error::WeightIndexOutOfRange {
                index: fg_index,
                len: self.weights.len(),
            })
    }
}
