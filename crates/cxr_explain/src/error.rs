//! Error types for explanation.

use thiserror::Error;

/// Result type alias using [`ExplainError`].
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Why an activation map could not be produced.
///
/// These never fail a classification; the caller logs them and omits the
/// heatmap.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExplainError {
    /// None of the configured target layers exists in the model.
    #[error("No target layer resolves: tried [{requested}] against {available} feature layers")]
    NoTargetLayer {
        /// The selectors that were tried.
        requested: String,
        /// Number of feature layers the model exposes.
        available: usize,
    },

    /// Target class is outside the classifier output.
    #[error("Target class {class} out of range for {n_classes} classes")]
    InvalidClass {
        /// Requested class index.
        class: usize,
        /// Number of classes.
        n_classes: usize,
    },

    /// The backward pass produced no gradient for the target layer.
    #[error("No gradient reached the target layer")]
    MissingGradient,

    /// The rectified map has no positive evidence.
    #[error("Degenerate activation map (max {max:e})")]
    Degenerate {
        /// Maximum of the rectified map.
        max: f32,
    },

    /// Activations or gradients contain NaN or infinity.
    #[error("Non-finite values in activation map")]
    NonFinite,

    /// Tensor readback failed.
    #[error("Backend error: {0}")]
    Backend(String),
}
