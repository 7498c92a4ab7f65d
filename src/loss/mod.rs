//! Equalized focal loss: forward computation plus gradient-driven
//! recalibration.
//!
//! Per training iteration, in this order:
//!
//! 1. [`EqualizedFocalLoss::forward`] computes the loss using the current
//!    per-class pos/neg gradient ratio.
//! 2. Backpropagation runs outside this crate; the AD machinery invokes
//!    [`EqualizedFocalLoss::collect_grad`] once per pyramid level, in
//!    reverse forward order.
//! 3. On the last level the statistics update, and the next `forward` sees
//!    the new ratios.
//!
//! The pieces are also usable separately: [`LossEngine`] for the pure loss
//! math, [`GradientAggregator`] for the statistics. The facade owns the
//! per-iteration [`ForwardContext`] and enforces the one-forward-one-cycle
//! protocol.

mod collector;
mod config;
mod engine;

pub use collector::{CycleState, GradientAggregator};
pub use config::EflConfig;
pub use engine::{ForwardContext, LossEngine};

use crate::comm::{Collective, SingleProcess};
use crate::error::{Error, Result};
use crate::reduce::{LossOutput, Reduction};
use crate::stats::ClassStatistics;
use crate::weight::ClassWeightTable;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Loss engine and gradient aggregator constructed as one unit, sharing one
/// configuration and the read/update contract on the ratio vector.
pub struct EqualizedFocalLoss<C: Collective = SingleProcess> {
    engine: LossEngine,
    aggregator: GradientAggregator<C>,
    default_reduction: Reduction,
    context: Option<ForwardContext>,
}

impl EqualizedFocalLoss<SingleProcess> {
    /// Single-worker construction; loads the class-weight table if the
    /// config names one.
    pub fn new(config: EflConfig) -> Result<Self> {
        Self::with_collective(config, SingleProcess)
    }
}

impl<C: Collective> EqualizedFocalLoss<C> {
    /// Construction for a data-parallel group; `comm` must be this worker's
    /// handle into the group.
    pub fn with_collective(config: EflConfig, comm: C) -> Result<Self> {
        let table = match &config.class_weight_path {
            Some(path) => Some(ClassWeightTable::from_json_file(path)?),
            None => None,
        };
        Self::with_weight_table(config, table, comm)
    }

    /// Construction with an already-built weight table (or `None`),
    /// bypassing the file load.
    pub fn with_weight_table(
        config: EflConfig,
        table: Option<ClassWeightTable>,
        comm: C,
    ) -> Result<Self> {
        config.validate()?;
        let engine = LossEngine::new(&config, table)?;
        let aggregator =
            GradientAggregator::new(config.num_fg_classes(), config.fpn_levels, comm);
        log::info!(
            "built EqualizedFocalLoss: focal_alpha={}, focal_gamma={}, scale_factor={}, \
             fpn_levels={}, num_fg_classes={}, world_size={}",
            config.focal_alpha,
            config.focal_gamma,
            config.scale_factor,
            config.fpn_levels,
            config.num_fg_classes(),
            aggregator.world_size(),
        );
        Ok(Self {
            engine,
            aggregator,
            default_reduction: config.reduction,
            context: None,
        })
    }

    /// Compute the loss with the configured default reduction.
    ///
    /// `normalizer` defaults to `1.0`; detection trainers typically pass the
    /// number of positive anchors.
    pub fn forward(
        &mut self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<i64>,
        normalizer: Option<f32>,
    ) -> Result<LossOutput> {
        self.forward_with(logits, labels, self.default_reduction, normalizer)
    }

    /// Compute the loss with an explicit reduction.
    ///
    /// Fails with [`Error::IncompleteCycle`] if the previous iteration's
    /// gradient cycle is still open — mixing gradients of two forwards would
    /// silently corrupt the statistics. A forward after a completed cycle
    /// (or with no backward at all, e.g. evaluation) overwrites the previous
    /// context.
    pub fn forward_with(
        &mut self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<i64>,
        reduction: Reduction,
        normalizer: Option<f32>,
    ) -> Result<LossOutput> {
        let buffered = self.aggregator.pending_levels();
        if buffered > 0 {
            return Err(Error::IncompleteCycle {
                buffered,
                fpn_levels: self.aggregator.fpn_levels(),
            });
        }
        let (output, context) = self.engine.forward(
            logits,
            labels,
            self.aggregator.ratios().view(),
            reduction,
            normalizer.unwrap_or(1.0),
        )?;
        self.context = Some(context);
        Ok(output)
    }

    /// Gradient-observation entry point, invoked once per pyramid level
    /// during backpropagation (reverse forward order), `[batch, classes,
    /// height, width]`.
    pub fn collect_grad(&mut self, level_grad: ndarray::ArrayView4<f32>) -> Result<CycleState> {
        let context = self.context.as_mut().ok_or(Error::MissingContext)?;
        self.aggregator.collect(level_grad, context)
    }

    /// Analytic `d loss / d logits` at the current calibration; rows of
    /// ignored samples are zero.
    pub fn input_gradient(
        &self,
        logits: ArrayView2<f32>,
        labels: ArrayView1<i64>,
        reduction: Reduction,
        normalizer: Option<f32>,
    ) -> Result<Array2<f32>> {
        self.engine.input_gradient(
            logits,
            labels,
            self.aggregator.ratios().view(),
            reduction,
            normalizer.unwrap_or(1.0),
        )
    }

    /// Current per-class pos/neg ratio vector.
    pub fn ratios(&self) -> &Array1<f32> {
        self.aggregator.ratios()
    }

    /// Accumulated per-class statistics.
    pub fn statistics(&self) -> &ClassStatistics {
        self.aggregator.statistics()
    }

    /// The loss-math half, for direct use with explicit ratios.
    pub fn engine(&self) -> &LossEngine {
        &self.engine
    }

    /// Discard the open cycle and the cached context, e.g. after the
    /// training loop decides to skip a corrupt batch.
    pub fn reset_cycle(&mut self) {
        self.aggregator.reset();
        self.context = None;
    }
}
