//! Equalized focal loss configuration.

use crate::error::{Error, Result};
use crate::reduce::Reduction;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Construction parameters for [`crate::loss::EqualizedFocalLoss`].
///
/// Defaults match the long-tailed detection setting the loss was designed
/// for: LVIS-scale class counts, `gamma = 2`, `alpha = 0.25`, a five-level
/// feature pyramid.
///
/// # Example
///
/// ```
/// use enfocar::EflConfig;
///
/// let config = EflConfig::new(1204)
///     .with_focal_gamma(2.0)
///     .with_scale_factor(8.0)
///     .with_fpn_levels(5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EflConfig {
    /// Total classes including background; foreground-only count is
    /// `num_classes - 1`. Label 0 is background, labels `1..num_classes`
    /// are foreground shifted by one.
    pub num_classes: usize,
    /// Base focusing exponent; must be positive.
    pub focal_gamma: f32,
    /// Positive/negative balancing weight; a negative value disables it.
    pub focal_alpha: f32,
    /// Strength of the dynamic perturbation on the focusing exponent.
    pub scale_factor: f32,
    /// Pyramid levels expected per gradient-collection cycle.
    pub fpn_levels: usize,
    /// Label value excluded from loss and statistics.
    pub ignore_index: i64,
    /// Default reduction applied by `forward`.
    pub reduction: Reduction,
    /// Scalar multiplier on the final loss.
    pub loss_weight: f32,
    /// Optional JSON file holding one non-negative weight per foreground
    /// class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_weight_path: Option<PathBuf>,
}

impl EflConfig {
    /// Configuration with the reference defaults for `num_classes` total
    /// classes (background included).
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            focal_gamma: 2.0,
            focal_alpha: 0.25,
            scale_factor: 8.0,
            fpn_levels: 5,
            ignore_index: -1,
            reduction: Reduction::Mean,
            loss_weight: 1.0,
            class_weight_path: None,
        }
    }

    /// Set the base focusing exponent.
    pub fn with_focal_gamma(mut self, focal_gamma: f32) -> Self {
        self.focal_gamma = focal_gamma;
        self
    }

    /// Set the alpha balancing weight; pass a negative value to disable.
    pub fn with_focal_alpha(mut self, focal_alpha: f32) -> Self {
        self.focal_alpha = focal_alpha;
        self
    }

    /// Set the dynamic-exponent scale factor.
    pub fn with_scale_factor(mut self, scale_factor: f32) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Set the number of pyramid levels per collection cycle.
    pub fn with_fpn_levels(mut self, fpn_levels: usize) -> Self {
        self.fpn_levels = fpn_levels;
        self
    }

    /// Set the ignored label value.
    pub fn with_ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// Set the default reduction.
    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    /// Set the scalar loss multiplier.
    pub fn with_loss_weight(mut self, loss_weight: f32) -> Self {
        self.loss_weight = loss_weight;
        self
    }

    /// Load per-class weights from a JSON file at construction.
    pub fn with_class_weight_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.class_weight_path = Some(path.into());
        self
    }

    /// Foreground-class count (background excluded).
    pub fn num_fg_classes(&self) -> usize {
        self.num_classes.saturating_sub(1)
    }

    /// Check all parameters; every constructor goes through this.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(Error::InvalidConfig(format!(
                "num_classes must be at least 2 (background + one foreground class), got {}",
                self.num_classes
            )));
        }
        if !(self.focal_gamma > 0.0) || !self.focal_gamma.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "focal_gamma must be positive and finite, got {}",
                self.focal_gamma
            )));
        }
        if !self.focal_alpha.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "focal_alpha must be finite, got {}",
                self.focal_alpha
            )));
        }
        if !(self.scale_factor >= 0.0) || !self.scale_factor.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "scale_factor must be non-negative and finite, got {}",
                self.scale_factor
            )));
        }
        if self.fpn_levels == 0 {
            return Err(Error::InvalidConfig(
                "fpn_levels must be at least 1".to_string(),
            ));
        }
        if !(self.loss_weight > 0.0) || !self.loss_weight.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "loss_weight must be positive and finite, got {}",
                self.loss_weight
            )));
        }
        if (0..self.num_classes as i64).contains(&self.ignore_index) {
            return Err(Error::InvalidConfig(format!(
                "ignore_index {} collides with a valid label",
                self.ignore_index
            )));
        }
        Ok(())
    }
}
