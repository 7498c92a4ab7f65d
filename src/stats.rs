//! Per-class gradient statistics.
//!
//! Running sums of positive- and negative-sample gradient magnitude, and the
//! derived pos/neg ratio that drives the dynamic focusing exponent. The sums
//! accumulate monotonically over the whole training run; only the ratio is
//! recomputed on each update.

use ndarray::Array1;

/// Guards the ratio against division by zero before any negative gradient
/// has been observed.
const RATIO_EPS: f32 = 1e-10;

/// Accumulated per-foreground-class gradient statistics.
///
/// Invariant: after every [`update`](Self::update), each ratio entry satisfies
/// `pos_neg[c] == clamp(pos_grad[c] / (neg_grad[c] + eps), 0, 1)`.
#[derive(Debug, Clone)]
pub struct ClassStatistics {
    pos_grad: Array1<f32>,
    neg_grad: Array1<f32>,
    pos_neg: Array1<f32>,
}

impl ClassStatistics {
    /// Fresh statistics: zero accumulated gradient, ratios at one.
    ///
    /// Starting the ratios at one means the dynamic exponent begins at the
    /// base `focal_gamma` for every class and only drifts once real
    /// gradients arrive.
    pub fn new(num_fg_classes: usize) -> Self {
        Self {
            pos_grad: Array1::zeros(num_fg_classes),
            neg_grad: Array1::zeros(num_fg_classes),
            pos_neg: Array1::ones(num_fg_classes),
        }
    }

    /// Number of foreground classes tracked.
    pub fn num_classes(&self) -> usize {
        self.pos_neg.len()
    }

    /// Accumulated positive-sample gradient magnitude per class.
    pub fn pos_grad(&self) -> &Array1<f32> {
        &self.pos_grad
    }

    /// Accumulated negative-sample gradient magnitude per class.
    pub fn neg_grad(&self) -> &Array1<f32> {
        &self.neg_grad
    }

    /// Current pos/neg ratio per class, each entry in `[0, 1]`.
    pub fn pos_neg(&self) -> &Array1<f32> {
        &self.pos_neg
    }

    /// Fold one iteration's (already all-reduced) gradient sums into the
    /// running totals and recompute the ratios.
    pub fn update(&mut self, pos_delta: &Array1<f32>, neg_delta: &Array1<f32>) {
        debug_assert_eq!(pos_delta.len(), self.pos_grad.len());
        debug_assert_eq!(neg_delta.len(), self.neg_grad.len());
        self.pos_grad += pos_delta;
        self.neg_grad += neg_delta;
        for (ratio, (&pos, &neg)) in self
            .pos_neg
            .iter_mut()
            .zip(self.pos_grad.iter().zip(self.neg_grad.iter()))
        {
            *ratio = (pos / (neg + RATIO_EPS)).clamp(0.0, 1.0);
        }
    }
}
