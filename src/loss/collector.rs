//! Gradient-statistics aggregation across pyramid levels and workers.

use crate::comm::Collective;
use crate::error::{Error, Result};
use crate::loss::engine::ForwardContext;
use crate::stats::ClassStatistics;
use ndarray::{Array1, Array3, ArrayView4, Axis};

/// Outcome of one [`GradientAggregator::collect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Fewer than `fpn_levels` levels have reported; nothing was computed.
    Pending,
    /// The cycle completed and the statistics were updated.
    Updated,
}

/// Stateful accumulator turning raw backpropagated gradients into per-class
/// pos/neg statistics, exactly once per completed set of pyramid levels.
///
/// Backpropagation visits pyramid levels in the reverse of forward order, so
/// the buffered levels are concatenated in reverse arrival order to restore
/// the per-sample layout the forward pass produced.
pub struct GradientAggregator<C: Collective> {
    num_fg_classes: usize,
    fpn_levels: usize,
    buffer: Vec<Array3<f32>>,
    stats: ClassStatistics,
    comm: C,
}

impl<C: Collective> GradientAggregator<C> {
    /// Fresh aggregator: zero accumulated gradient, ratios at one.
    pub fn new(num_fg_classes: usize, fpn_levels: usize, comm: C) -> Self {
        Self {
            num_fg_classes,
            fpn_levels,
            buffer: Vec::with_capacity(fpn_levels),
            stats: ClassStatistics::new(num_fg_classes),
            comm,
        }
    }

    /// Current statistics.
    pub fn statistics(&self) -> &ClassStatistics {
        &self.stats
    }

    /// Current pos/neg ratio vector, read by the loss engine each forward.
    pub fn ratios(&self) -> &Array1<f32> {
        self.stats.pos_neg()
    }

    /// Levels buffered in the currently open cycle (0 between cycles).
    pub fn pending_levels(&self) -> usize {
        self.buffer.len()
    }

    /// Configured levels per cycle.
    pub fn fpn_levels(&self) -> usize {
        self.fpn_levels
    }

    /// Workers participating in the statistics all-reduce.
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Discard a half-collected cycle, e.g. when the training loop skips a
    /// corrupt batch after a mid-backward failure.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Observe one pyramid level's gradient, `[batch, classes, height,
    /// width]` as produced by a channel-first detection head.
    ///
    /// Called once per level during backpropagation, finest-level-last. On
    /// the `fpn_levels`-th call the buffered levels are reassembled, masked
    /// with `ctx`, summed into per-class pos/neg magnitudes, all-reduced
    /// across workers and folded into the running statistics; `ctx` is then
    /// marked consumed. Every worker must reach the completing call in the
    /// same step, or the collective blocks the whole group.
    pub fn collect(
        &mut self,
        level_grad: ArrayView4<f32>,
        ctx: &mut ForwardContext,
    ) -> Result<CycleState> {
        if ctx.consumed {
            return Err(Error::ExtraLevel {
                fpn_levels: self.fpn_levels,
            });
        }
        let (batch, channels, height, width) = level_grad.dim();
        if channels != self.num_fg_classes {
            return Err(Error::ClassDimMismatch {
                expected: self.num_fg_classes,
                actual: channels,
            });
        }
        if let Some(first) = self.buffer.first() {
            if first.dim().0 != batch {
                return Err(Error::LevelBatchMismatch {
                    expected: first.dim().0,
                    actual: batch,
                });
            }
        }

        // Channel-first -> channel-last, then flatten the spatial grid:
        // [B, C, H, W] -> [B, H * W, C].
        let channel_last = level_grad.permuted_axes([0, 2, 3, 1]);
        let flat = channel_last
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, height * width, self.num_fg_classes))
            .map_err(|e| Error::InvalidConfig(format!("level gradient reshape failed: {e}")))?;
        self.buffer.push(flat);

        if self.buffer.len() < self.fpn_levels {
            return Ok(CycleState::Pending);
        }
        self.finish_cycle(ctx)?;
        Ok(CycleState::Updated)
    }

    fn finish_cycle(&mut self, ctx: &mut ForwardContext) -> Result<()> {
        // Undo the backward-order level reversal: last-arrived level came
        // first in the forward layout.
        let views: Vec<_> = self.buffer.iter().rev().map(|level| level.view()).collect();
        let joined = ndarray::concatenate(Axis(1), &views)
            .map_err(|e| Error::InvalidConfig(format!("level concatenation failed: {e}")))?;
        let (batch, locations, classes) = joined.dim();
        let grad = joined
            .into_shape_with_order((batch * locations, classes))
            .map_err(|e| Error::InvalidConfig(format!("gradient reshape failed: {e}")))?;

        if grad.nrows() != ctx.num_samples() {
            return Err(Error::SampleCountMismatch {
                expected: ctx.num_samples(),
                actual: grad.nrows(),
            });
        }

        let mut pos_delta = vec![0.0_f32; classes];
        let mut neg_delta = vec![0.0_f32; classes];
        for (i, &keep) in ctx.mask.iter().enumerate() {
            if !keep {
                continue;
            }
            for c in 0..classes {
                let magnitude = grad[[i, c]].abs();
                let target = ctx.targets[[i, c]];
                pos_delta[c] += magnitude * target;
                neg_delta[c] += magnitude * (1.0 - target);
            }
        }

        self.comm.all_reduce_sum(&mut pos_delta)?;
        self.comm.all_reduce_sum(&mut neg_delta)?;

        self.stats
            .update(&Array1::from(pos_delta), &Array1::from(neg_delta));
        self.buffer.clear();
        ctx.consumed = true;

        log::debug!(
            "gradient cycle complete: {} levels, {} of {} samples kept",
            self.fpn_levels,
            ctx.num_kept(),
            ctx.num_samples()
        );
        Ok(())
    }
}
