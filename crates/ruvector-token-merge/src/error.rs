//! Error types for the token reduction engine.
//!
//! Errors are deterministic: the same inputs always produce the same
//! variant. Degenerate reduction counts are clamped and never surface here.

use thiserror::Error;

/// Error type for planning, merging and scheduling token reductions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReductionError {
    /// The per-layer schedule does not cover the model's layer stack.
    #[error("schedule has {found} layer entries, model has {expected} layers")]
    ScheduleLength {
        /// Layer count of the host model.
        expected: usize,
        /// Entries supplied in the schedule.
        found: usize,
    },

    /// A strategy name that the engine does not implement.
    #[error("unsupported reduction strategy: {0}")]
    UnsupportedStrategy(String),

    /// A configuration document could not be parsed or serialised.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A numeric parameter is outside its valid range.
    #[error("parameter out of range: {name} = {value} (expected {expected})")]
    ParameterOutOfRange {
        /// Name of the parameter.
        name: &'static str,
        /// The offending value.
        value: f64,
        /// Human-readable description of the valid range.
        expected: &'static str,
    },

    /// A tensor does not have the shape the operation requires.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The layer index is not covered by the schedule.
    #[error("layer {layer} out of range for a {layers}-layer schedule")]
    LayerOutOfRange {
        /// Requested layer.
        layer: usize,
        /// Layers in the schedule.
        layers: usize,
    },

    /// A forward pass asked for the same layer twice.
    #[error("layer {layer} was already reduced in this pass")]
    LayerReplayed {
        /// Layer that was requested again.
        layer: usize,
    },

    /// A forward pass skipped ahead of the next scheduled layer.
    #[error("layer {layer} requested before layer {expected}")]
    LayerOutOfOrder {
        /// Requested layer.
        layer: usize,
        /// Next layer the pass expects.
        expected: usize,
    },
}

/// Result alias for token reduction operations.
pub type Result<T> = std::result::Result<T, ReductionError>;

impl ReductionError {
    /// Configuration problems are fatal at pass setup.
    #[inline]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ReductionError::ScheduleLength { .. }
                | ReductionError::UnsupportedStrategy(_)
                | ReductionError::InvalidConfig(_)
                | ReductionError::ParameterOutOfRange { .. }
        )
    }

    /// Input problems that a caller can fix and retry in a fresh pass.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReductionError::ShapeMismatch(_)
                | ReductionError::LayerOutOfRange { .. }
                | ReductionError::LayerReplayed { .. }
                | ReductionError::LayerOutOfOrder { .. }
        )
    }

    pub(crate) fn out_of_range(name: &'static str, value: f64, expected: &'static str) -> Self {
        ReductionError::ParameterOutOfRange {
            name,
            value,
            expected,
        }
    }
}
