//! # Portfolio Data Utilities
//!
//! $$
//! \hat\Sigma = \frac{1}{T-1}\sum_{t=1}^{T}(\mathbf{x}_t-\bar{\mathbf{x}})(\mathbf{x}_t-\bar{\mathbf{x}})^\top
//! $$
//!
//! Return derivation, moment estimation and online standardization of price panels.
//! Panels are `T x n` matrices: one row per observation, one column per asset.

use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::error::MarkowitzError;
use crate::error::Result;

fn require_rows(m: &DMatrix<f64>, required: usize) -> Result<()> {
  if m.nrows() < required {
    return Err(MarkowitzError::InsufficientHistory {
      required,
      actual: m.nrows(),
    });
  }
  Ok(())
}

/// Simple returns `(p_t - p_{t-1}) / p_{t-1}` per asset.
pub fn derive_returns(prices: &DMatrix<f64>) -> Result<DMatrix<f64>> {
  require_rows(prices, 2)?;
  let (t, n) = prices.shape();

  let out = DMatrix::from_fn(t - 1, n, |i, j| {
    let prev = prices[(i, j)];
    (prices[(i + 1, j)] - prev) / prev
  });

  if out.iter().all(|v| v.is_finite()) {
    Ok(out)
  } else {
    Err(MarkowitzError::NonFinite("price returns"))
  }
}

/// Log returns `ln(p_t / p_{t-1})` per asset. Prices must be strictly positive.
pub fn log_returns(prices: &DMatrix<f64>) -> Result<DMatrix<f64>> {
  require_rows(prices, 2)?;
  if prices.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
    return Err(MarkowitzError::NonFinite("prices"));
  }
  let (t, n) = prices.shape();

  Ok(DMatrix::from_fn(t - 1, n, |i, j| {
    (prices[(i + 1, j)] / prices[(i, j)]).ln()
  }))
}

/// Column means of a return panel.
pub fn mean_returns(returns: &DMatrix<f64>) -> Result<DVector<f64>> {
  require_rows(returns, 1)?;
  Ok(returns.row_mean().transpose())
}

/// Unbiased sample covariance of a return panel.
pub fn sample_covariance(returns: &DMatrix<f64>) -> Result<DMatrix<f64>> {
  require_rows(returns, 2)?;
  let t = returns.nrows();
  let means = returns.row_mean();

  let mut centered = returns.clone();
  for mut row in centered.row_iter_mut() {
    row -= &means;
  }

  let cov = centered.transpose() * &centered / (t - 1) as f64;
  // symmetrize away rounding noise
  Ok((&cov + cov.transpose()) * 0.5)
}

/// Online per-column standardizer.
///
/// Moments are merged batch by batch, so the scaler can be refit as new observations arrive.
/// Columns with zero variance are left unscaled.
#[derive(Clone, Debug)]
pub struct StandardScaler {
  count: usize,
  mean: DVector<f64>,
  m2: DVector<f64>,
}

impl Default for StandardScaler {
  fn default() -> Self {
    Self {
      count: 0,
      mean: DVector::zeros(0),
      m2: DVector::zeros(0),
    }
  }
}

impl StandardScaler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of observations seen so far.
  pub fn n_samples_seen(&self) -> usize {
    self.count
  }

  pub fn mean(&self) -> &DVector<f64> {
    &self.mean
  }

  /// Population standard deviation per column, with zeros replaced by one.
  pub fn scale(&self) -> DVector<f64> {
    self.m2.map(|m2| {
      let sd = (m2 / self.count as f64).sqrt();
      if sd > 0.0 {
        sd
      } else {
        1.0
      }
    })
  }

  /// Merge the moments of `batch` into the running estimate.
  pub fn partial_fit(&mut self, batch: &DMatrix<f64>) -> Result<&mut Self> {
    if batch.nrows() == 0 {
      return Ok(self);
    }
    if batch.iter().any(|v| !v.is_finite()) {
      return Err(MarkowitzError::NonFinite("scaler batch"));
    }
    if self.count == 0 {
      self.mean = DVector::zeros(batch.ncols());
      self.m2 = DVector::zeros(batch.ncols());
    } else {
      self.check_width(batch)?;
    }

    let nb = batch.nrows() as f64;
    let na = self.count as f64;
    let total = na + nb;

    let batch_mean = batch.row_mean().transpose();
    let mut batch_m2 = DVector::zeros(batch.ncols());
    for row in batch.row_iter() {
      let d = row.transpose() - &batch_mean;
      batch_m2 += d.component_mul(&d);
    }

    let delta = &batch_mean - &self.mean;
    self.m2 += batch_m2 + delta.component_mul(&delta) * (na * nb / total);
    self.mean += delta * (nb / total);
    self.count += batch.nrows();

    Ok(self)
  }

  /// Standardize `data` with the fitted moments.
  pub fn transform(&self, data: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    self.check_fitted()?;
    self.check_width(data)?;
    let scale = self.scale();

    Ok(DMatrix::from_fn(data.nrows(), data.ncols(), |i, j| {
      (data[(i, j)] - self.mean[j]) / scale[j]
    }))
  }

  /// Map standardized values back to the original units.
  pub fn inverse_transform(&self, data: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    self.check_fitted()?;
    self.check_width(data)?;
    let scale = self.scale();

    Ok(DMatrix::from_fn(data.nrows(), data.ncols(), |i, j| {
      data[(i, j)] * scale[j] + self.mean[j]
    }))
  }

  fn check_fitted(&self) -> Result<()> {
    if self.count == 0 {
      return Err(MarkowitzError::InsufficientHistory {
        required: 1,
        actual: 0,
      });
    }
    Ok(())
  }

  fn check_width(&self, data: &DMatrix<f64>) -> Result<()> {
    if data.ncols() != self.mean.len() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "scaler columns",
        expected: self.mean.len(),
        actual: data.ncols(),
      });
    }
    Ok(())
  }
}

/// Incremental standardization of a price and factor feed.
///
/// Holds one factor scaler per asset and a single scaler over simple returns. Each update
/// refits the scalers before transforming, so standardization tracks the history seen so far.
#[derive(Clone, Debug)]
pub struct Preprocessing {
  last_price: DVector<f64>,
  factor_scalers: Vec<StandardScaler>,
  return_scaler: StandardScaler,
}

impl Preprocessing {
  /// Fit on a `(T + 1) x n` price panel and `T` factor matrices of shape `n x k`.
  pub fn new(train_prices: &DMatrix<f64>, train_factors: &[DMatrix<f64>]) -> Result<Self> {
    let returns = derive_returns(train_prices)?;
    if train_factors.len() != returns.nrows() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "factor steps",
        expected: returns.nrows(),
        actual: train_factors.len(),
      });
    }

    let n = train_prices.ncols();
    let k = train_factors.first().map_or(0, |f| f.ncols());
    if let Some(f) = train_factors.iter().find(|f| f.nrows() != n) {
      return Err(MarkowitzError::ShapeMismatch {
        what: "factor rows",
        expected: n,
        actual: f.nrows(),
      });
    }
    if let Some(f) = train_factors.iter().find(|f| f.ncols() != k) {
      return Err(MarkowitzError::ShapeMismatch {
        what: "factor columns",
        expected: k,
        actual: f.ncols(),
      });
    }

    let mut factor_scalers = vec![StandardScaler::new(); n];
    for (asset, scaler) in factor_scalers.iter_mut().enumerate() {
      let history = DMatrix::from_fn(train_factors.len(), k, |t, j| train_factors[t][(asset, j)]);
      scaler.partial_fit(&history)?;
    }

    let mut return_scaler = StandardScaler::new();
    return_scaler.partial_fit(&returns)?;

    Ok(Self {
      last_price: train_prices.row(train_prices.nrows() - 1).transpose(),
      factor_scalers,
      return_scaler,
    })
  }

  pub fn n_assets(&self) -> usize {
    self.last_price.len()
  }

  pub fn last_price(&self) -> &DVector<f64> {
    &self.last_price
  }

  /// Refit each asset's factor scaler with `factors` (`n x k`) and return the standardized matrix.
  pub fn handle_update_factors(&mut self, factors: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if factors.nrows() != self.n_assets() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "factor rows",
        expected: self.n_assets(),
        actual: factors.nrows(),
      });
    }

    let mut out = DMatrix::zeros(factors.nrows(), factors.ncols());
    for (asset, scaler) in self.factor_scalers.iter_mut().enumerate() {
      let row = factors.rows(asset, 1).into_owned();
      scaler.partial_fit(&row)?;
      out.set_row(asset, &scaler.transform(&row)?.row(0));
    }
    Ok(out)
  }

  /// Turn the next price vector into a standardized simple return, refitting the return scaler.
  pub fn handle_update_price(&mut self, price: &DVector<f64>) -> Result<DVector<f64>> {
    if price.len() != self.n_assets() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "price vector",
        expected: self.n_assets(),
        actual: price.len(),
      });
    }

    let step = (price - &self.last_price).component_div(&self.last_price);
    if step.iter().any(|v| !v.is_finite()) {
      return Err(MarkowitzError::NonFinite("prices"));
    }
    self.last_price = price.clone();

    let row = DMatrix::from_row_slice(1, step.len(), step.as_slice());
    self.return_scaler.partial_fit(&row)?;
    Ok(self.return_scaler.transform(&row)?.row(0).transpose())
  }

  /// Map a standardized return prediction back to simple returns.
  pub fn inverse_transform_return(&self, prediction: &DVector<f64>) -> Result<DVector<f64>> {
    Ok(
      self
        .return_scaler
        .inverse_transform(&DMatrix::from_row_slice(1, prediction.len(), prediction.as_slice()))?
        .row(0)
        .transpose(),
    )
  }

  /// Standardize a `T x n` block of simple returns without refitting.
  pub fn normalize_returns(&self, returns: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    self.return_scaler.transform(returns)
  }

  /// Standardize `T` factor matrices (`n x k` each) without refitting.
  pub fn normalize_factors(&self, factors: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>> {
    factors
      .iter()
      .map(|f| {
        if f.nrows() != self.n_assets() {
          return Err(MarkowitzError::ShapeMismatch {
            what: "factor rows",
            expected: self.n_assets(),
            actual: f.nrows(),
          });
        }
        let mut out = DMatrix::zeros(f.nrows(), f.ncols());
        for (asset, scaler) in self.factor_scalers.iter().enumerate() {
          out.set_row(asset, &scaler.transform(&f.rows(asset, 1).into_owned())?.row(0));
        }
        Ok(out)
      })
      .collect()
  }
}
