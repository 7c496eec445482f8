//! # Allocation Strategies
//!
//! $$
//! \mathbf{w}_t = \mathcal{S}(t, \mathbf{p}_t, F_t)
//! $$
//!
//! Per-step allocation contract consumed by the backtest harness, with a rolling-window
//! Markowitz implementation.

use std::collections::VecDeque;

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::data::derive_returns;
use super::data::mean_returns;
use super::data::sample_covariance;
use super::markowitz::MarkowitzOptimizer;
use super::types::OptimizerConfig;
use crate::error::MarkowitzError;
use crate::error::Result;

/// A strategy maps the current prices and factor exposures to an allocation.
pub trait AllocationStrategy {
  /// Produce an allocation of length `prices.len()` for step `index`.
  ///
  /// `factors` has one row per asset. The harness normalizes the allocation by its L1 norm.
  fn handle_update(
    &mut self,
    index: usize,
    prices: &DVector<f64>,
    factors: &DMatrix<f64>,
  ) -> Result<DVector<f64>>;
}

fn check_factor_rows(prices: &DVector<f64>, factors: &DMatrix<f64>) -> Result<()> {
  if factors.nrows() != prices.len() {
    return Err(MarkowitzError::ShapeMismatch {
      what: "factor rows",
      expected: prices.len(),
      actual: factors.nrows(),
    });
  }
  Ok(())
}

/// Equal weight in every asset.
#[derive(Clone, Copy, Debug, Default)]
pub struct EqualWeightStrategy;

impl AllocationStrategy for EqualWeightStrategy {
  fn handle_update(
    &mut self,
    _index: usize,
    prices: &DVector<f64>,
    factors: &DMatrix<f64>,
  ) -> Result<DVector<f64>> {
    check_factor_rows(prices, factors)?;
    Ok(DVector::from_element(prices.len(), 1.0))
  }
}

/// Rolling-window mean-variance strategy.
///
/// Keeps the last `lookback + 1` price vectors, estimates mean returns and their sample
/// covariance, and targets a fixed portfolio return. Falls back to equal weights until the
/// window is full.
#[derive(Clone, Debug)]
pub struct MarkowitzStrategy {
  lookback: usize,
  target_return: f64,
  config: OptimizerConfig,
  history: VecDeque<DVector<f64>>,
  optimizer: Option<MarkowitzOptimizer>,
}

impl MarkowitzStrategy {
  /// `lookback` is the number of returns in the estimation window and must be at least 2.
  pub fn new(lookback: usize, target_return: f64, config: OptimizerConfig) -> Result<Self> {
    if lookback < 2 {
      return Err(MarkowitzError::InsufficientHistory {
        required: 2,
        actual: lookback,
      });
    }

    Ok(Self {
      lookback,
      target_return,
      config,
      history: VecDeque::with_capacity(lookback + 1),
      optimizer: None,
    })
  }

  pub fn lookback(&self) -> usize {
    self.lookback
  }

  /// The optimizer used for the latest allocation, once the window has filled.
  pub fn optimizer(&self) -> Option<&MarkowitzOptimizer> {
    self.optimizer.as_ref()
  }

  fn window(&self) -> DMatrix<f64> {
    let n = self.history.front().map_or(0, |p| p.len());
    DMatrix::from_fn(self.history.len(), n, |i, j| self.history[i][j])
  }
}

impl AllocationStrategy for MarkowitzStrategy {
  fn handle_update(
    &mut self,
    index: usize,
    prices: &DVector<f64>,
    factors: &DMatrix<f64>,
  ) -> Result<DVector<f64>> {
    check_factor_rows(prices, factors)?;
    if let Some(last) = self.history.back() {
      if last.len() != prices.len() {
        return Err(MarkowitzError::ShapeMismatch {
          what: "price vector",
          expected: last.len(),
          actual: prices.len(),
        });
      }
    }

    self.history.push_back(prices.clone());
    if self.history.len() > self.lookback + 1 {
      self.history.pop_front();
    }
    if self.history.len() <= self.lookback {
      debug!(index, filled = self.history.len(), "estimation window not full");
      return Ok(DVector::from_element(prices.len(), 1.0));
    }

    let returns = derive_returns(&self.window())?;
    let r = mean_returns(&returns)?;
    let cov = sample_covariance(&returns)?;

    let allocation = match self.optimizer.as_mut() {
      Some(optimizer) => optimizer.normal_update(self.target_return, r, cov)?,
      None => {
        let mut optimizer = MarkowitzOptimizer::with_config(r.clone(), cov.clone(), self.config)?;
        let allocation = optimizer.normal_update(self.target_return, r, cov)?;
        self.optimizer = Some(optimizer);
        allocation
      }
    };

    debug!(
      index,
      variance = allocation.variance,
      perturbed = allocation.perturbation.is_some(),
      "markowitz allocation"
    );
    Ok(allocation.weights)
  }
}
