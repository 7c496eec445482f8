//! # Portfolio Types
//!
//! $$
//! \mathbf{w}(r^\*) = \alpha\,\mathbf{w}_1 + (1-\alpha)\,\mathbf{w}_2
//! $$
//!
//! Configuration, diagnostics and result containers for the mean-variance optimizer.

use nalgebra::DVector;

/// Default diagonal perturbation applied to a singular covariance matrix.
pub const DEFAULT_EPSILON: f64 = 1e-8;

/// Runtime configuration for [`super::MarkowitzOptimizer`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerConfig {
  /// Multiple of the identity added to the covariance matrix when it is singular.
  pub epsilon: f64,
  /// Smallest accepted ratio `min |pivot| / max |pivot|` of the LU factorization.
  pub singularity_tolerance: f64,
  /// Smallest accepted ratio `det C / (c_ee * c_rr)`.
  pub degeneracy_tolerance: f64,
  /// Smallest accepted ratio `|c_er| / sqrt(c_ee * c_rr)` in the batch path, where the
  /// return-tilted fund is divided by `c_er`.
  pub fund_tolerance: f64,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      epsilon: DEFAULT_EPSILON,
      singularity_tolerance: 1e-14,
      degeneracy_tolerance: 1e-12,
      fund_tolerance: 1e-6,
    }
  }
}

/// Record of the diagonal perturbation applied during covariance inversion.
///
/// When present, the stored covariance matrix has been replaced by `Σ + epsilon * I`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Perturbation {
  /// Amount added to every diagonal entry.
  pub epsilon: f64,
}

/// Output of a single-target optimization.
#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioAllocation {
  /// Asset weights, not normalized beyond `sum(w) = 1`.
  pub weights: DVector<f64>,
  /// Portfolio variance `w' Σ w`.
  pub variance: f64,
  /// Set when the covariance matrix had to be perturbed to invert it.
  pub perturbation: Option<Perturbation>,
}

/// Output of a batch optimization, aligned with the requested target returns.
#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioBatch {
  /// One weight vector per target return.
  pub weights: Vec<DVector<f64>>,
  /// One variance per target return.
  pub variances: Vec<f64>,
  /// Set when the covariance matrix had to be perturbed to invert it.
  pub perturbation: Option<Perturbation>,
}

impl PortfolioBatch {
  pub fn len(&self) -> usize {
    self.weights.len()
  }

  pub fn is_empty(&self) -> bool {
    self.weights.is_empty()
  }
}

/// The two fund portfolios spanning the efficient frontier, with the scalars of the 2x2 system.
#[derive(Clone, Debug, PartialEq)]
pub struct TwoFundBasis {
  /// `Σ⁻¹ e`, unnormalized minimum-variance direction.
  pub v1: DVector<f64>,
  /// `Σ⁻¹ r`, unnormalized return-tilted direction.
  pub v2: DVector<f64>,
  pub c_rr: f64,
  pub c_re: f64,
  pub c_er: f64,
  pub c_ee: f64,
  pub det_c: f64,
}

impl TwoFundBasis {
  /// Global minimum-variance fund `v1 / c_ee`.
  pub fn w1(&self) -> DVector<f64> {
    &self.v1 / self.c_ee
  }

  /// Return-tilted fund `v2 / c_er`.
  pub fn w2(&self) -> DVector<f64> {
    &self.v2 / self.c_er
  }

  /// Blend coefficient on `w1` for a target return.
  pub fn alpha(&self, target_return: f64) -> f64 {
    self.c_ee * (self.c_rr - self.c_er * target_return) / self.det_c
  }

  /// Closed-form variance of the efficient portfolio at `target_return`.
  pub fn frontier_variance(&self, target_return: f64) -> f64 {
    (self.c_ee * target_return * target_return - 2.0 * self.c_re * target_return + self.c_rr)
      / self.det_c
  }
}

/// The global minimum-variance portfolio.
#[derive(Clone, Debug, PartialEq)]
pub struct MinimumVariancePortfolio {
  pub weights: DVector<f64>,
  /// `c_re / c_ee`.
  pub expected_return: f64,
  /// `1 / c_ee`.
  pub variance: f64,
}

/// A single point on the efficient frontier.
#[derive(Clone, Debug, PartialEq)]
pub struct FrontierPoint {
  pub target_return: f64,
  pub weights: DVector<f64>,
  pub variance: f64,
  pub volatility: f64,
}
