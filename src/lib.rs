//! # enfocar
//!
//! Adaptively-calibrated classification loss for extreme long-tailed,
//! multi-label object detection.
//!
//! Instead of weighting classes by static frequencies, the loss observes the
//! gradients it produces: per class, the ratio of accumulated positive- to
//! negative-sample gradient magnitude is a live proxy for how well that class
//! is learned. Under-learned (rare) classes get a larger focusing exponent on
//! the next iteration; well-learned ones stay at the base focal setting.
//!
//! Two components run once per training iteration:
//!
//! - [`LossEngine`] — forward loss from logits and integer labels, shaped by
//!   the per-class dynamic exponent
//! - [`GradientAggregator`] — collects backpropagated gradients per pyramid
//!   level, reassembles them, all-reduces per-class sums across workers and
//!   updates the ratios the engine reads next
//!
//! [`EqualizedFocalLoss`] wires the pair together and enforces the
//! forward-then-collect protocol.
//!
//! # Example
//!
//! ```
//! use enfocar::{EflConfig, EqualizedFocalLoss};
//! use ndarray::{array, Array4};
//!
//! // 3 classes total: background + 2 foreground, one pyramid level.
//! let mut loss = EqualizedFocalLoss::new(
//!     EflConfig::new(3).with_fpn_levels(1),
//! )?;
//!
//! let logits = array![[2.0_f32, -2.0], [0.3, 0.1]];
//! let labels = array![1_i64, 0];
//! let value = loss.forward(logits.view(), labels.view(), None)?;
//! assert!(value.scalar().unwrap() > 0.0);
//!
//! // During backpropagation the AD machinery hands over one gradient
//! // tensor per level, channel-first [batch, classes, height, width].
//! let level_grad = Array4::from_elem((1, 2, 1, 2), 0.5);
//! loss.collect_grad(level_grad.view())?;
//!
//! // Ratios have moved; the next forward is recalibrated.
//! assert!(loss.ratios().iter().all(|&r| (0.0..=1.0).contains(&r)));
//! # Ok::<(), enfocar::Error>(())
//! ```

pub mod comm;
pub mod error;
pub mod loss;
pub mod reduce;
pub mod stats;
pub mod weight;

pub use comm::{Collective, LocalGroup, SingleProcess};
pub use error::{Error, Result};
pub use loss::{CycleState, EflConfig, EqualizedFocalLoss, ForwardContext, GradientAggregator, LossEngine};
pub use reduce::{reduce, LossOutput, Reduction};
pub use stats::ClassStatistics;
pub use weight::ClassWeightTable;
