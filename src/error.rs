//! Error types for loss computation and gradient aggregation.
//!
//! Every failure is surfaced immediately; nothing in this crate retries or
//! silently truncates. Recovering (e.g. skipping a corrupt batch) is the
//! surrounding training loop's job.

use thiserror::Error;

/// Errors produced by the loss engine, the gradient aggregator and their
/// collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// Logits and labels disagree on the number of samples.
    #[error("logits have {logits} rows but {labels} labels were given")]
    BatchMismatch { logits: usize, labels: usize },

    /// A tensor's class dimension does not match the configured
    /// foreground-class count.
    #[error("expected {expected} foreground classes, got {actual}")]
    ClassDimMismatch { expected: usize, actual: usize },

    /// A label is outside `{ignore_index} ∪ {0..=num_fg_classes}`.
    #[error("label {label} outside valid range 0..={max} (ignore index is {ignore_index})")]
    LabelOutOfRange {
        label: i64,
        max: usize,
        ignore_index: i64,
    },

    /// A foreground label maps past the end of the class-weight table.
    #[error("class weight table has {len} entries but foreground index {index} was requested")]
    WeightIndexOutOfRange { index: usize, len: usize },

    /// Invalid construction or call parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A gradient level arrived but no forward pass produced a context.
    #[error("gradient level arrived with no pending forward context")]
    MissingContext,

    /// More gradient levels arrived than `fpn_levels`; the surrounding loop
    /// is miscounting pyramid levels.
    #[error("gradient level arrived after the cycle already completed ({fpn_levels} levels collected)")]
    ExtraLevel { fpn_levels: usize },

    /// `forward` was called while a gradient-collection cycle is still open.
    #[error("forward called with {buffered} of {fpn_levels} gradient levels still buffered")]
    IncompleteCycle { buffered: usize, fpn_levels: usize },

    /// The reassembled gradient does not cover the samples seen in forward.
    #[error("reassembled gradient has {actual} samples, forward pass produced {expected}")]
    SampleCountMismatch { expected: usize, actual: usize },

    /// Batch size changed between pyramid levels of the same cycle.
    #[error("pyramid level has batch size {actual}, earlier levels had {expected}")]
    LevelBatchMismatch { expected: usize, actual: usize },

    /// A collective communication call failed.
    #[error("communication error: {0}")]
    Comm(String),

    /// Reading an external resource (class-weight table) failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Deserializing an external resource failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
