//! # Backtest Harness
//!
//! $$
//! R_t = \frac{\mathbf{w}_t^\top \mathbf{x}_t}{\lVert \mathbf{w}_t \rVert_1},\qquad
//! \text{SR} = \frac{\bar R}{\sigma_R}\sqrt{252}
//! $$
//!
//! Replays a price panel through an [`AllocationStrategy`] and scores the resulting
//! excess log-return series by its annualized Sharpe ratio.

use impl_new_derive::ImplNew;
use nalgebra::DMatrix;
use statrs::statistics::Statistics;
use tracing::info;

use super::data::log_returns;
use super::strategy::AllocationStrategy;
use crate::error::MarkowitzError;
use crate::error::Result;

/// Annualization and risk-free settings for [`Backtest`].
#[derive(ImplNew, Clone, Copy, Debug, PartialEq)]
pub struct BacktestConfig {
  /// Annual risk-free rate, compounded into a per-period log rate.
  pub annual_risk_free: f64,
  /// Number of periods per year.
  pub periods_per_year: f64,
}

impl Default for BacktestConfig {
  fn default() -> Self {
    Self {
      annual_risk_free: 0.025,
      periods_per_year: 252.0,
    }
  }
}

impl BacktestConfig {
  pub fn period_risk_free(&self) -> f64 {
    (1.0 + self.annual_risk_free).ln() / self.periods_per_year
  }
}

/// Realized per-step returns and their Sharpe ratio.
#[derive(Clone, Debug, PartialEq)]
pub struct BacktestReport {
  pub returns: Vec<f64>,
  pub sharpe: f64,
}

/// A price panel with per-step factor exposures.
#[derive(Clone, Debug)]
pub struct Backtest {
  prices: DMatrix<f64>,
  factors: Vec<DMatrix<f64>>,
  excess_log_returns: DMatrix<f64>,
  config: BacktestConfig,
}

impl Backtest {
  /// `prices` is `(N + 1) x n`; `factors` holds `N` matrices with `n` rows each.
  pub fn new(prices: DMatrix<f64>, factors: Vec<DMatrix<f64>>, config: BacktestConfig) -> Result<Self> {
    let excess_log_returns = log_returns(&prices)?.add_scalar(-config.period_risk_free());

    if factors.len() != excess_log_returns.nrows() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "factor steps",
        expected: excess_log_returns.nrows(),
        actual: factors.len(),
      });
    }
    if let Some(f) = factors.iter().find(|f| f.nrows() != prices.ncols()) {
      return Err(MarkowitzError::ShapeMismatch {
        what: "factor rows",
        expected: prices.ncols(),
        actual: f.nrows(),
      });
    }

    Ok(Self {
      prices,
      factors,
      excess_log_returns,
      config,
    })
  }

  pub fn n_steps(&self) -> usize {
    self.factors.len()
  }

  pub fn n_assets(&self) -> usize {
    self.prices.ncols()
  }

  pub fn config(&self) -> &BacktestConfig {
    &self.config
  }

  /// Ask the strategy for an allocation at every step and record the L1-normalized return.
  pub fn simulate<S: AllocationStrategy>(&self, strategy: &mut S) -> Result<Vec<f64>> {
    let n = self.n_assets();
    let mut realized = Vec::with_capacity(self.n_steps());

    for (step, factors) in self.factors.iter().enumerate() {
      let prices = self.prices.row(step).transpose();
      let alloc = strategy.handle_update(step, &prices, factors)?;

      if alloc.len() != n {
        return Err(MarkowitzError::ShapeMismatch {
          what: "allocation",
          expected: n,
          actual: alloc.len(),
        });
      }

      let gross: f64 = alloc.iter().map(|w| w.abs()).sum();
      if !(gross.is_finite() && gross > 0.0) {
        return Err(MarkowitzError::ZeroExposure { step });
      }

      let step_returns = self.excess_log_returns.row(step).transpose();
      realized.push(alloc.dot(&step_returns) / gross);
    }

    Ok(realized)
  }

  /// Annualized Sharpe ratio of a per-period return series. Zero when the series has no spread.
  pub fn evaluate_sharpe(&self, returns: &[f64]) -> f64 {
    if returns.is_empty() {
      return 0.0;
    }

    let mean = returns.mean();
    let std = returns.population_std_dev();
    if !(std.is_finite() && std > 0.0) {
      return 0.0;
    }

    mean / std * self.config.periods_per_year.sqrt()
  }

  /// Simulate and score in one pass.
  pub fn run<S: AllocationStrategy>(&self, strategy: &mut S) -> Result<BacktestReport> {
    let returns = self.simulate(strategy)?;
    let sharpe = self.evaluate_sharpe(&returns);
    info!(steps = returns.len(), sharpe, "backtest finished");

    Ok(BacktestReport { returns, sharpe })
  }
}
