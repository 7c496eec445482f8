//! # Errors
//!
//! $$
//! \det C = c_{ee}c_{rr} - c_{re}c_{er} = 0 \implies \text{no unique two-fund decomposition}
//! $$
//!
//! Error taxonomy shared by the optimizer and its preprocessing and backtest helpers.

use thiserror::Error;

/// Errors surfaced by portfolio construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarkowitzError {
  /// The covariance matrix could not be inverted, even after the diagonal perturbation retry.
  #[error("covariance matrix is singular (still not invertible after adding {epsilon:e}*I)")]
  SingularCovariance { epsilon: f64 },

  /// Expected returns are collinear with the unit vector, so the 2x2 system has no inverse.
  #[error("degenerate return vector: expected returns are effectively equal across assets")]
  DegenerateReturnVector,

  /// Dimensions of the supplied arrays disagree.
  #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
  ShapeMismatch {
    what: &'static str,
    expected: usize,
    actual: usize,
  },

  /// No assets were supplied.
  #[error("asset universe is empty")]
  EmptyUniverse,

  /// Input contained NaN or infinite values.
  #[error("non-finite value in {0}")]
  NonFinite(&'static str),

  /// Not enough observations to estimate the requested statistic.
  #[error("insufficient history: need at least {required} observations, got {actual}")]
  InsufficientHistory { required: usize, actual: usize },

  /// An allocation had zero gross exposure and cannot be L1-normalized.
  #[error("allocation at step {step} has zero gross exposure")]
  ZeroExposure { step: usize },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MarkowitzError>;
