//! Loss reduction.
//!
//! Detection losses are normalized by an external count (typically the number
//! of positive anchors), not by the element count, so `Mean` here divides the
//! sum by the caller-supplied normalizer rather than by `N * C`.

use crate::error::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How to collapse the per-sample, per-class loss tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Sum divided by the normalizer.
    Mean,
    /// Plain sum; the normalizer is ignored.
    Sum,
    /// No reduction; the elementwise tensor is returned unchanged.
    None,
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Mean => write!(f, "mean"),
            Reduction::Sum => write!(f, "sum"),
            Reduction::None => write!(f, "none"),
        }
    }
}

impl FromStr for Reduction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Reduction::Mean),
            "sum" => Ok(Reduction::Sum),
            "none" => Ok(Reduction::None),
            other => Err(Error::InvalidConfig(format!(
                "unknown reduction '{other}', expected mean|sum|none"
            ))),
        }
    }
}

/// Result of a loss computation: a scalar for `mean`/`sum`, the elementwise
/// tensor for `none`.
#[derive(Debug, Clone, PartialEq)]
pub enum LossOutput {
    Scalar(f32),
    Elementwise(Array2<f32>),
}

impl LossOutput {
    /// The scalar value, if this output was reduced.
    pub fn scalar(&self) -> Option<f32> {
        match self {
            LossOutput::Scalar(v) => Some(*v),
            LossOutput::Elementwise(_) => None,
        }
    }

    /// The elementwise tensor, if `reduction` was `none`.
    pub fn elementwise(&self) -> Option<&Array2<f32>> {
        match self {
            LossOutput::Scalar(_) => None,
            LossOutput::Elementwise(t) => Some(t),
        }
    }
}

/// Collapse `loss` according to `reduction`.
///
/// The normalizer must be strictly positive; it only affects `Mean`.
pub fn reduce(loss: Array2<f32>, reduction: Reduction, normalizer: f32) -> Result<LossOutput> {
    if !(normalizer > 0.0) || !normalizer.is_finite() {
        return Err(Error::InvalidConfig(format!(
            "normalizer must be a positive finite number, got {normalizer}"
        )));
    }
    match reduction {
        Reduction::Mean => Ok(LossOutput::Scalar(loss.sum() / normalizer)),
        Reduction::Sum => Ok(LossOutput::Scalar(loss.sum())),
        Reduction::None => Ok(LossOutput::Elementwise(loss)),
    }
}
