//! Forward loss computation with a per-class dynamic focusing exponent.

use crate::error::{Error, Result};
use crate::loss::config::EflConfig;
use crate::reduce::{reduce, LossOutput, Reduction};
use crate::weight::ClassWeightTable;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Floor applied to `pred_t` before the logarithm; keeps the loss finite for
/// saturated logits without affecting well-conditioned values.
const PRED_EPS: f32 = 1e-6;

/// Per-iteration carrier for the sample mask and one-hot targets.
///
/// Produced by [`LossEngine::forward`] and consumed exactly once by the
/// gradient collector of the same iteration. The `consumed` flag makes the
/// one-iteration lifetime checkable: a collect call after consumption means
/// the surrounding loop sent more levels than configured.
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub(crate) mask: Array1<bool>,
    pub(crate) targets: Array2<f32>,
    pub(crate) consumed: bool,
}

impl ForwardContext {
    /// Total samples seen by the forward pass (ignored ones included).
    pub fn num_samples(&self) -> usize {
        self.mask.len()
    }

    /// Samples that survive the ignore-index filter.
    pub fn num_kept(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Whether a completed gradient cycle already used this context.
    pub fn is_consumed(&self) -> bool {
        self.consumed
    }
}

/// Numerically stable sigmoid.
fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Stateless-per-call loss computation.
///
/// Reads the current pos/neg ratio vector through an explicit argument; it
/// never owns or mutates the statistics. See
/// [`crate::loss::EqualizedFocalLoss`] for the wired-up pair.
#[derive(Debug, Clone)]
pub struct LossEngine {
    num_fg_classes: usize,
    focal_gamma: f32,
    focal_alpha: f32,
    scale_factor: f32,
    ignore_index: i64,
    loss_weight: f32,
    class_weight: Option<ClassWeightTable>,
}

impl LossEngine {
    /// Build an engine from a validated config and an optional weight table.
    ///
    /// The table, when present, must cover exactly the foreground classes.
    pub fn new(config: &EflConfig, class_weight: Option<ClassWeightTable>) -> Result<Self> {
        config.validate()?;
        let num_fg_classes = config.num_fg_classes();
        if let Some(table) = &class_weight {
            if table.len() != num_fg_classes {
                return Err(Error::InvalidConfig(format!(
                    "class weight table covers {} classes, model has {} foreground classes",
                    table.len(),
                    num_fg_classes
                )));
            }
        }
        Ok(Self {
            num_fg_classes,
            focal_gamma: config.focal_gamma,
            focal_alpha: config.focal_alpha,
            scale_factor: config.scale_factor,
            ignore_index: config.ignore_index,
            loss_weight: config.loss_weight,
            class_weight,
        })
    }

    /// Foreground-class count.
    pub fn num_fg_classes(&self) -> usize {
        self.num_fg_classes
    }

    /// Per-class dynamic focusing exponent for the given ratio vector:
    /// `focal_gamma + scale_factor * (1 - pos_neg)`. Under-learned classes
    /// (low ratio) get the larger exponent.
    pub fn dynamic_gamma(&self, ratios: ArrayView1<f32>) -> Array1<f32> {
        ratios.mapv(|r| self.focal_gamma + self.scale_factor * (1.0 - r))
    }

    /// Compute the loss.
    ///
    /// * `logits` — `[N, C]`, one column per foreground class.
    /// * `labels` — `[N]`, values in `{ignore_index} ∪ {0..=C}`; 0 is
    ///   background, `1..=C` are foreground shifted by one.
    /// * `ratios` — current per-class pos/neg gradient ratios, `[C]`.
    /// * `normalizer` — positive divisor applied under `Mean`.
    ///
    /// Returns the reduced loss and the [`ForwardContext`] the gradient
    /// collector needs later in the same iteration.
    pub fn forward(
        &self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<i64>,
        ratios: ArrayView1<f32>,
        reduction: Reduction,
        normalizer: f32,
    ) -> Result<(LossOutput, ForwardContext)> {
        let (n, mask, targets) = self.expand_targets(logits, labels, ratios)?;

        let dy_gamma = self.dynamic_gamma(ratios);
        let wf = dy_gamma.mapv(|g| g / self.focal_gamma);

        let mut cls_loss = Array2::<f32>::zeros((n, self.num_fg_classes));
        for i in 0..n {
            if !mask[i] {
                continue;
            }
            let row_weight = self.row_weight(labels[i])?;
            for c in 0..self.num_fg_classes {
                let t = targets[[i, c]];
                let p = sigmoid(logits[[i, c]]);
                let pred_t = (p * t + (1.0 - p) * (1.0 - t)).max(PRED_EPS);
                // dy_gamma and wf are constants with respect to the inputs;
                // only pred_t carries gradient.
                let mut value = -pred_t.ln() * (1.0 - pred_t).powf(dy_gamma[c]) * wf[c];
                if self.focal_alpha >= 0.0 {
                    value *= self.focal_alpha * t + (1.0 - self.focal_alpha) * (1.0 - t);
                }
                cls_loss[[i, c]] = value * row_weight * self.loss_weight;
            }
        }

        let output = reduce(cls_loss, reduction, normalizer)?;
        let context = ForwardContext {
            mask,
            targets,
            consumed: false,
        };
        Ok((output, context))
    }

    /// Analytic `d loss / d logits` under the same reduction semantics,
    /// treating the dynamic exponent and weighting factor as constants.
    ///
    /// Rows of ignored samples are zero. For `Sum` and `None` the gradient of
    /// the elementwise sum is returned; for `Mean` it is scaled by
    /// `1 / normalizer`.
    pub fn input_gradient(
        &self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<i64>,
        ratios: ArrayView1<f32>,
        reduction: Reduction,
        normalizer: f32,
    ) -> Result<Array2<f32>> {
        if !(normalizer > 0.0) || !normalizer.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "normalizer must be a positive finite number, got {normalizer}"
            )));
        }
        let (n, mask, targets) = self.expand_targets(logits, labels, ratios)?;

        let dy_gamma = self.dynamic_gamma(ratios);
        let wf = dy_gamma.mapv(|g| g / self.focal_gamma);
        let scale = match reduction {
            Reduction::Mean => 1.0 / normalizer,
            Reduction::Sum | Reduction::None => 1.0,
        };

        let mut grad = Array2::<f32>::zeros((n, self.num_fg_classes));
        for i in 0..n {
            if !mask[i] {
                continue;
            }
            let row_weight = self.row_weight(labels[i])?;
            for c in 0..self.num_fg_classes {
                let t = targets[[i, c]];
                let p = sigmoid(logits[[i, c]]);
                let pred_t = (p * t + (1.0 - p) * (1.0 - t)).max(PRED_EPS);
                let gamma = dy_gamma[c];
                // d/d pred_t of -ln(pt) * (1 - pt)^gamma
                let focal = (1.0 - pred_t).powf(gamma);
                let d_loss_d_pt = -focal / pred_t
                    + gamma * pred_t.ln() * (1.0 - pred_t).powf(gamma - 1.0);
                // d pred_t / d logit: (2t - 1) * sigmoid'(x)
                let d_pt_d_x = (2.0 * t - 1.0) * p * (1.0 - p);
                let mut value = d_loss_d_pt * wf[c] * d_pt_d_x;
                if self.focal_alpha >= 0.0 {
                    value *= self.focal_alpha * t + (1.0 - self.focal_alpha) * (1.0 - t);
                }
                grad[[i, c]] = value * row_weight * self.loss_weight * scale;
            }
        }
        Ok(grad)
    }

    /// Validate shapes and labels, build the sample mask and the one-hot
    /// target matrix (background column already dropped: foreground label
    /// `l` sets column `l - 1`, background rows stay all-zero).
    fn expand_targets(
        &self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<i64>,
        ratios: ArrayView1<f32>,
    ) -> Result<(usize, Array1<bool>, Array2<f32>)> {
        let n = logits.nrows();
        if labels.len() != n {
            return Err(Error::BatchMismatch {
                logits: n,
                labels: labels.len(),
            });
        }
        if logits.ncols() != self.num_fg_classes {
            return Err(Error::ClassDimMismatch {
                expected: self.num_fg_classes,
                actual: logits.ncols(),
            });
        }
        if ratios.len() != self.num_fg_classes {
            return Err(Error::ClassDimMismatch {
                expected: self.num_fg_classes,
                actual: ratios.len(),
            });
        }

        let mut mask = Array1::from_elem(n, true);
        let mut targets = Array2::<f32>::zeros((n, self.num_fg_classes));
        for (i, &label) in labels.iter().enumerate() {
            if label == self.ignore_index {
                mask[i] = false;
                continue;
            }
            if label < 0 || label as usize > self.num_fg_classes {
                return Err(Error::LabelOutOfRange {
                    label,
                    max: self.num_fg_classes,
                    ignore_index: self.ignore_index,
                });
            }
            if label > 0 {
                targets[[i, label as usize - 1]] = 1.0;
            }
        }
        Ok((n, mask, targets))
    }

    /// Loss multiplier for one sample: `table[label - 1] + 1.0` for
    /// foreground, exactly `1.0` for background or when no table is set.
    fn row_weight(&self, label: i64) -> Result<f32> {
        match (&self.class_weight, label) {
            (Some(table), l) if l > 0 => table.multiplier(l as usize - 1),
            _ => Ok(1.0),
        }
    }
}
