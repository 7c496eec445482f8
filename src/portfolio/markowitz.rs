//! # Markowitz Optimizer
//!
//! $$
//! \min_{\mathbf{w}} \mathbf{w}^\top\Sigma\mathbf{w}
//! \quad\text{s.t.}\quad \mathbf{r}^\top\mathbf{w} = r^\*,\ \mathbf{e}^\top\mathbf{w} = 1
//! $$
//!
//! Closed-form mean-variance allocation. The Lagrangian gives
//! $\mathbf{w} = \lambda\Sigma^{-1}\mathbf{r} + \mu\Sigma^{-1}\mathbf{e}$ with
//! $(\lambda, \mu) = C^{-1}(r^\*, 1)$; the batch path reuses the two fund portfolios
//! $\Sigma^{-1}\mathbf{e}/c_{ee}$ and $\Sigma^{-1}\mathbf{r}/c_{er}$ for every target.
//!
//! The inverse covariance is cached and tagged with a covariance version, so it is
//! recomputed only when the stored matrix actually changes.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::linalg::ensure_finite_matrix;
use super::linalg::ensure_finite_vector;
use super::linalg::square_from_rows;
use super::linalg::try_invert;
use super::types::FrontierPoint;
use super::types::MinimumVariancePortfolio;
use super::types::OptimizerConfig;
use super::types::Perturbation;
use super::types::PortfolioAllocation;
use super::types::PortfolioBatch;
use super::types::TwoFundBasis;
use crate::error::MarkowitzError;
use crate::error::Result;

/// Stateful mean-variance optimizer over a fixed asset universe.
///
/// Mutating methods take `&mut self`; share an optimizer across threads only behind a lock
/// held for the whole update-and-read cycle.
#[derive(Clone, Debug)]
pub struct MarkowitzOptimizer {
  r: DVector<f64>,
  cov: DMatrix<f64>,
  config: OptimizerConfig,
  cov_version: u64,
  inv_cov: DMatrix<f64>,
  inv_version: Option<u64>,
  perturbation: Option<Perturbation>,
}

impl MarkowitzOptimizer {
  /// Construct an optimizer with the default configuration.
  pub fn new(r: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
    Self::with_config(r, cov, OptimizerConfig::default())
  }

  /// Construct an optimizer with explicit configuration.
  pub fn with_config(r: DVector<f64>, cov: DMatrix<f64>, config: OptimizerConfig) -> Result<Self> {
    validate_inputs(&r, &cov)?;

    Ok(Self {
      r,
      cov,
      config,
      cov_version: 0,
      inv_cov: DMatrix::zeros(0, 0),
      inv_version: None,
      perturbation: None,
    })
  }

  /// Construct from a return slice and a row-major covariance matrix.
  pub fn from_rows(r: &[f64], cov: &[Vec<f64>]) -> Result<Self> {
    Self::new(DVector::from_column_slice(r), square_from_rows(cov)?)
  }

  pub fn n_assets(&self) -> usize {
    self.r.len()
  }

  pub fn returns(&self) -> &DVector<f64> {
    &self.r
  }

  /// Stored covariance matrix, including any diagonal perturbation applied during inversion.
  pub fn covariance(&self) -> &DMatrix<f64> {
    &self.cov
  }

  pub fn config(&self) -> &OptimizerConfig {
    &self.config
  }

  /// Perturbation currently applied to the stored covariance matrix, if any.
  pub fn perturbation(&self) -> Option<Perturbation> {
    self.perturbation
  }

  /// Version counter of the stored covariance matrix. Bumped on every change.
  pub fn covariance_version(&self) -> u64 {
    self.cov_version
  }

  /// Replace the stored return vector and covariance matrix.
  ///
  /// The cached inverse survives only if `cov` is identical to the stored matrix.
  pub fn update(&mut self, r: DVector<f64>, cov: DMatrix<f64>) -> Result<()> {
    validate_inputs(&r, &cov)?;
    self.r = r;
    if cov != self.cov {
      self.replace_covariance(cov);
    }
    Ok(())
  }

  /// Replace the stored return vector, keeping the covariance matrix.
  pub fn set_returns(&mut self, r: DVector<f64>) -> Result<()> {
    if r.len() != self.cov.nrows() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "return vector",
        expected: self.cov.nrows(),
        actual: r.len(),
      });
    }
    ensure_finite_vector(&r, "return vector")?;
    self.r = r;
    Ok(())
  }

  fn replace_covariance(&mut self, cov: DMatrix<f64>) {
    self.cov = cov;
    self.cov_version += 1;
    self.perturbation = None;
  }

  /// Invert the stored covariance matrix.
  ///
  /// A singular matrix is perturbed once by `epsilon * I` (persisted on the optimizer)
  /// and inverted again. A second failure is returned as
  /// [`MarkowitzError::SingularCovariance`].
  pub fn invert_covariance_matrix(&mut self) -> Result<&DMatrix<f64>> {
    debug!(n = self.n_assets(), version = self.cov_version, "inverting covariance matrix");

    let tolerance = self.config.singularity_tolerance;
    let matrix = match try_invert(&self.cov, tolerance) {
      Some(inv) => inv,
      None => {
        let epsilon = self.config.epsilon;
        warn!(epsilon, "singular covariance matrix, perturbing diagonal");
        self.perturb(epsilon);

        match try_invert(&self.cov, tolerance) {
          Some(inv) => inv,
          None => {
            error!(epsilon, "covariance matrix still singular after perturbation");
            return Err(MarkowitzError::SingularCovariance { epsilon });
          }
        }
      }
    };

    self.inv_cov = matrix;
    self.inv_version = Some(self.cov_version);
    Ok(&self.inv_cov)
  }

  fn perturb(&mut self, epsilon: f64) {
    let n = self.cov.nrows();
    self.cov += DMatrix::identity(n, n) * epsilon;
    self.cov_version += 1;
    let total = self.perturbation.map_or(0.0, |p| p.epsilon) + epsilon;
    self.perturbation = Some(Perturbation { epsilon: total });
  }

  fn ensure_inverse(&mut self, reinvert: bool) -> Result<()> {
    if reinvert || self.inv_version != Some(self.cov_version) {
      self.invert_covariance_matrix()?;
    }
    Ok(())
  }

  /// Fund directions and the scalars of the 2x2 constraint system, unchecked.
  fn quartet(&mut self, reinvert: bool) -> Result<TwoFundBasis> {
    self.ensure_inverse(reinvert)?;
    let e = DVector::from_element(self.n_assets(), 1.0);

    let v1 = &self.inv_cov * &e;
    let v2 = &self.inv_cov * &self.r;

    let c_rr = self.r.dot(&v2);
    let c_re = self.r.dot(&v1);
    let c_er = e.dot(&v2);
    let c_ee = e.dot(&v1);

    Ok(TwoFundBasis {
      v1,
      v2,
      c_rr,
      c_re,
      c_er,
      c_ee,
      det_c: c_ee * c_rr - c_re * c_er,
    })
  }

  /// [`Self::quartet`], rejecting a singular 2x2 system.
  fn basis(&mut self, reinvert: bool) -> Result<TwoFundBasis> {
    let basis = self.quartet(reinvert)?;

    let scale = (basis.c_ee * basis.c_rr).abs();
    if !basis.det_c.is_finite() || basis.det_c.abs() <= self.config.degeneracy_tolerance * scale {
      debug!(
        det_c = basis.det_c,
        c_ee = basis.c_ee,
        c_rr = basis.c_rr,
        "degenerate 2x2 system"
      );
      return Err(MarkowitzError::DegenerateReturnVector);
    }

    Ok(basis)
  }

  /// Minimum-variance allocation achieving `target_return`, via the Lagrange multipliers.
  ///
  /// `reinvert` forces the inverse to be recomputed; otherwise the cached inverse is reused
  /// while the covariance matrix is unchanged.
  pub fn design_portfolio_for_return(
    &mut self,
    target_return: f64,
    reinvert: bool,
  ) -> Result<DVector<f64>> {
    if !target_return.is_finite() {
      return Err(MarkowitzError::NonFinite("target return"));
    }
    debug!(target_return, "calculating optimal portfolio");

    let TwoFundBasis {
      v1: c_e,
      v2: c_r,
      c_rr,
      c_re,
      c_er,
      c_ee,
      det_c,
    } = self.basis(reinvert)?;

    // C^{-1} (r*, 1) with C = [[c_rr, c_re], [c_er, c_ee]]
    let lambda = (c_ee * target_return - c_re) / det_c;
    let mu = (c_rr - c_er * target_return) / det_c;

    Ok(c_r * lambda + c_e * mu)
  }

  /// Minimum-variance allocations for every target, reusing one pair of fund portfolios.
  ///
  /// The output is aligned with `target_returns`.
  pub fn design_portfolios_for_return(
    &mut self,
    target_returns: &[f64],
    reinvert: bool,
  ) -> Result<Vec<DVector<f64>>> {
    if target_returns.iter().any(|t| !t.is_finite()) {
      return Err(MarkowitzError::NonFinite("target return"));
    }
    debug!(targets = target_returns.len(), "calculating optimal portfolios");

    let basis = self.basis(reinvert)?;
    if basis.c_er.abs() <= self.config.fund_tolerance * (basis.c_ee * basis.c_rr).abs().sqrt() {
      debug!(c_er = basis.c_er, "return-tilted fund has zero net weight");
      return Err(MarkowitzError::DegenerateReturnVector);
    }

    let w1 = basis.w1();
    let w2 = basis.w2();

    Ok(
      target_returns
        .iter()
        .map(|&target| {
          let alpha = basis.alpha(target);
          &w1 * alpha + &w2 * (1.0 - alpha)
        })
        .collect(),
    )
  }

  /// Portfolio variance `w' Σ w` against the stored covariance matrix.
  pub fn variance(&self, omega: &DVector<f64>) -> Result<f64> {
    self.check_allocation(omega)?;
    Ok(omega.dot(&(&self.cov * omega)))
  }

  fn check_allocation(&self, omega: &DVector<f64>) -> Result<()> {
    if omega.len() != self.cov.nrows() {
      return Err(MarkowitzError::ShapeMismatch {
        what: "allocation",
        expected: self.cov.nrows(),
        actual: omega.len(),
      });
    }
    Ok(())
  }

  /// Variance of an arbitrary allocation.
  ///
  /// `reinvert` refreshes the cached inverse as a side effect. The variance does not use the
  /// inverse, so a failed refresh is logged and the variance is still returned.
  pub fn variance_of_strategy(&mut self, omega: &DVector<f64>, reinvert: bool) -> Result<f64> {
    self.check_allocation(omega)?;
    if reinvert {
      if let Err(err) = self.invert_covariance_matrix() {
        warn!(%err, "inverse refresh failed during variance evaluation");
      }
    }
    self.variance(omega)
  }

  /// Replace `(r, Σ)`, then compute the optimal allocation for `desired_return` and its variance.
  pub fn normal_update(
    &mut self,
    desired_return: f64,
    r: DVector<f64>,
    cov: DMatrix<f64>,
  ) -> Result<PortfolioAllocation> {
    self.update(r, cov)?;

    let weights = self.design_portfolio_for_return(desired_return, false)?;
    let variance = self.variance(&weights)?;

    Ok(PortfolioAllocation {
      weights,
      variance,
      perturbation: self.perturbation,
    })
  }

  /// Replace `(r, Σ)`, then compute allocations and variances for every desired return.
  pub fn multi_update(
    &mut self,
    desired_returns: &[f64],
    r: DVector<f64>,
    cov: DMatrix<f64>,
  ) -> Result<PortfolioBatch> {
    self.update(r, cov)?;

    let weights = self.design_portfolios_for_return(desired_returns, false)?;
    let variances = weights
      .iter()
      .map(|w| self.variance(w))
      .collect::<Result<Vec<_>>>()?;

    Ok(PortfolioBatch {
      weights,
      variances,
      perturbation: self.perturbation,
    })
  }

  /// The two fund portfolios for the stored `(r, Σ)`.
  pub fn two_fund_basis(&mut self) -> Result<TwoFundBasis> {
    self.basis(false)
  }

  /// Global minimum-variance portfolio, ignoring the return constraint.
  ///
  /// Only `c_ee` is needed, so this succeeds for constant return vectors.
  pub fn minimum_variance_portfolio(&mut self) -> Result<MinimumVariancePortfolio> {
    let basis = self.quartet(false)?;
    if !(basis.c_ee.is_finite() && basis.c_ee > 0.0) {
      debug!(c_ee = basis.c_ee, "minimum-variance fund has no positive budget");
      return Err(MarkowitzError::DegenerateReturnVector);
    }

    Ok(MinimumVariancePortfolio {
      weights: basis.w1(),
      expected_return: basis.c_re / basis.c_ee,
      variance: 1.0 / basis.c_ee,
    })
  }

  /// Closed-form variance of the efficient portfolio at `target_return`.
  pub fn frontier_variance(&mut self, target_return: f64) -> Result<f64> {
    Ok(self.basis(false)?.frontier_variance(target_return))
  }

  /// Efficient portfolios over `points` evenly spaced targets in `[min_return, max_return]`.
  pub fn efficient_frontier(
    &mut self,
    min_return: f64,
    max_return: f64,
    points: usize,
  ) -> Result<Vec<FrontierPoint>> {
    let targets: Vec<f64> = match points {
      0 => Vec::new(),
      1 => vec![min_return],
      _ => {
        let step = (max_return - min_return) / (points - 1) as f64;
        (0..points).map(|i| min_return + step * i as f64).collect()
      }
    };

    let weights = self.design_portfolios_for_return(&targets, false)?;
    targets
      .into_iter()
      .zip(weights)
      .map(|(target_return, weights)| {
        let variance = self.variance(&weights)?;
        Ok(FrontierPoint {
          target_return,
          weights,
          variance,
          volatility: variance.max(0.0).sqrt(),
        })
      })
      .collect()
  }
}

fn validate_inputs(r: &DVector<f64>, cov: &DMatrix<f64>) -> Result<()> {
  let n = r.len();
  if n == 0 {
    return Err(MarkowitzError::EmptyUniverse);
  }
  if cov.nrows() != n {
    return Err(MarkowitzError::ShapeMismatch {
      what: "covariance rows",
      expected: n,
      actual: cov.nrows(),
    });
  }
  if cov.ncols() != n {
    return Err(MarkowitzError::ShapeMismatch {
      what: "covariance columns",
      expected: n,
      actual: cov.ncols(),
    });
  }
  ensure_finite_vector(r, "return vector")?;
  ensure_finite_matrix(cov, "covariance matrix")
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use approx::assert_relative_eq;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;
  use tracing_test::traced_test;

  use super::*;

  fn two_asset() -> MarkowitzOptimizer {
    MarkowitzOptimizer::from_rows(&[0.10, 0.20], &[vec![0.04, 0.0], vec![0.0, 0.09]]).unwrap()
  }

  fn four_asset() -> (DVector<f64>, DMatrix<f64>) {
    let r = DVector::from_vec(vec![0.05, 0.08, 0.12, 0.03]);
    let cov = DMatrix::from_row_slice(
      4,
      4,
      &[
        0.040, 0.006, 0.010, 0.002, //
        0.006, 0.090, 0.012, 0.004, //
        0.010, 0.012, 0.160, 0.001, //
        0.002, 0.004, 0.001, 0.010,
      ],
    );
    (r, cov)
  }

  #[test]
  fn two_asset_allocation_matches_hand_solution() {
    let mut opt = two_asset();
    let w = opt.design_portfolio_for_return(0.15, true).unwrap();

    // Two assets and two constraints pin the allocation: w1 + w2 = 1, 0.1 w1 + 0.2 w2 = 0.15.
    assert_abs_diff_eq!(w[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(w[1], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(opt.variance(&w).unwrap(), 0.0325, epsilon = 1e-9);
  }

  #[test]
  fn allocation_satisfies_constraints() {
    let (r, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(r.clone(), cov).unwrap();
    let e = DVector::from_element(4, 1.0);

    for target in [-0.05, 0.0, 0.04, 0.07, 0.15, 0.3] {
      let w = opt.design_portfolio_for_return(target, false).unwrap();
      assert_relative_eq!(r.dot(&w), target, epsilon = 1e-9, max_relative = 1e-9);
      assert_relative_eq!(e.dot(&w), 1.0, epsilon = 1e-9);
    }
  }

  #[test]
  fn batch_matches_single_target() {
    let (r, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(r, cov).unwrap();
    let targets = [0.02, 0.05, 0.05, 0.09, 0.14];

    let batch = opt.design_portfolios_for_return(&targets, true).unwrap();
    assert_eq!(batch.len(), targets.len());

    for (target, w_batch) in targets.iter().zip(batch.iter()) {
      let w_single = opt.design_portfolio_for_return(*target, false).unwrap();
      for i in 0..w_single.len() {
        assert_abs_diff_eq!(w_batch[i], w_single[i], epsilon = 1e-9);
      }
    }
  }

  #[test]
  fn batch_endpoints_match_two_asset_singles() {
    let mut opt = two_asset();
    let batch = opt
      .design_portfolios_for_return(&[0.10, 0.15, 0.20], true)
      .unwrap();
    let low = opt.design_portfolio_for_return(0.10, false).unwrap();
    let high = opt.design_portfolio_for_return(0.20, false).unwrap();

    for i in 0..2 {
      assert_abs_diff_eq!(batch[0][i], low[i], epsilon = 1e-9);
      assert_abs_diff_eq!(batch[2][i], high[i], epsilon = 1e-9);
    }
    assert_abs_diff_eq!(batch[0][0], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(batch[2][1], 1.0, epsilon = 1e-9);
  }

  #[test]
  fn empty_batch_is_empty() {
    let mut opt = two_asset();
    assert!(opt.design_portfolios_for_return(&[], true).unwrap().is_empty());
  }

  #[test]
  fn no_feasible_alternative_has_lower_variance() {
    let (r, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(r.clone(), cov).unwrap();
    let target = 0.07;
    let w = opt.design_portfolio_for_return(target, true).unwrap();
    let best = opt.variance(&w).unwrap();

    // Orthonormal basis of span{r, e}; directions orthogonal to it keep both constraints.
    let e = DVector::from_element(4, 1.0);
    let q1 = e.normalize();
    let q2 = (&r - &q1 * q1.dot(&r)).normalize();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
      let raw = DVector::from_fn(4, |_, _| rng.gen_range(-1.0..1.0));
      let d = &raw - &q1 * q1.dot(&raw) - &q2 * q2.dot(&raw);
      let alt = &w + d * rng.gen_range(-2.0..2.0);

      assert_abs_diff_eq!(r.dot(&alt), target, epsilon = 1e-9);
      assert!(opt.variance(&alt).unwrap() >= best - 1e-12);
    }
  }

  #[test]
  fn frontier_variance_matches_evaluated_variance() {
    let (r, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(r, cov).unwrap();

    for target in [0.01, 0.06, 0.11] {
      let w = opt.design_portfolio_for_return(target, false).unwrap();
      let evaluated = opt.variance(&w).unwrap();
      assert_relative_eq!(
        opt.frontier_variance(target).unwrap(),
        evaluated,
        max_relative = 1e-9
      );
    }
  }

  #[test]
  fn minimum_variance_portfolio_is_frontier_vertex() {
    let (r, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(r, cov).unwrap();
    let gmv = opt.minimum_variance_portfolio().unwrap();

    assert_abs_diff_eq!(gmv.weights.sum(), 1.0, epsilon = 1e-12);
    let at_vertex = opt.design_portfolio_for_return(gmv.expected_return, false).unwrap();
    assert_relative_eq!(opt.variance(&at_vertex).unwrap(), gmv.variance, max_relative = 1e-9);
    for target in [gmv.expected_return - 0.02, gmv.expected_return + 0.02] {
      assert!(opt.frontier_variance(target).unwrap() > gmv.variance);
    }
  }

  #[test]
  fn efficient_frontier_spacing() {
    let mut opt = two_asset();
    let frontier = opt.efficient_frontier(0.10, 0.20, 5).unwrap();

    assert_eq!(frontier.len(), 5);
    assert_abs_diff_eq!(frontier[2].target_return, 0.15, epsilon = 1e-12);
    assert_abs_diff_eq!(frontier[2].variance, 0.0325, epsilon = 1e-9);
    assert_abs_diff_eq!(
      frontier[2].volatility,
      0.0325_f64.sqrt(),
      epsilon = 1e-9
    );
    assert!(opt.efficient_frontier(0.1, 0.2, 0).unwrap().is_empty());
    assert_eq!(opt.efficient_frontier(0.1, 0.2, 1).unwrap().len(), 1);
  }

  #[test]
  #[traced_test]
  fn singular_covariance_is_perturbed_once() {
    let r = DVector::from_vec(vec![0.05, 0.05, 0.10]);
    let cov = DMatrix::from_row_slice(
      3,
      3,
      &[0.04, 0.04, 0.01, 0.04, 0.04, 0.01, 0.01, 0.01, 0.09],
    );
    let mut opt = MarkowitzOptimizer::new(r.clone(), cov.clone()).unwrap();

    let inv = opt.invert_covariance_matrix().unwrap().clone();
    assert!(inv.iter().all(|v| v.is_finite()));
    assert!(logs_contain("perturbing diagonal"));

    assert_eq!(opt.perturbation(), Some(Perturbation { epsilon: 1e-8 }));
    let expected = &cov + DMatrix::identity(3, 3) * 1e-8;
    assert_eq!(opt.covariance(), &expected);

    let product = opt.covariance() * &inv;
    for i in 0..3 {
      for j in 0..3 {
        let id = if i == j { 1.0 } else { 0.0 };
        assert_abs_diff_eq!(product[(i, j)], id, epsilon = 1e-6);
      }
    }

    let w = opt.design_portfolio_for_return(0.08, false).unwrap();
    assert!(w.iter().all(|v| v.is_finite()));
    assert_abs_diff_eq!(r.dot(&w), 0.08, epsilon = 1e-6);
    assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-6);
  }

  #[test]
  fn badly_scaled_covariance_is_not_perturbed() {
    let mut opt =
      MarkowitzOptimizer::from_rows(&[0.1, 0.2], &[vec![1.0, 0.0], vec![0.0, 1e-15]]).unwrap();

    opt.invert_covariance_matrix().unwrap();
    assert_eq!(opt.perturbation(), None);
    assert_eq!(opt.covariance()[(1, 1)], 1e-15);
  }

  #[test]
  fn normal_update_reports_perturbation() {
    let r = DVector::from_vec(vec![0.05, 0.05, 0.10]);
    let cov = DMatrix::from_row_slice(
      3,
      3,
      &[0.04, 0.04, 0.01, 0.04, 0.04, 0.01, 0.01, 0.01, 0.09],
    );
    let mut opt = MarkowitzOptimizer::new(r.clone(), DMatrix::identity(3, 3)).unwrap();

    let result = opt.normal_update(0.08, r, cov).unwrap();
    assert_eq!(result.perturbation, Some(Perturbation { epsilon: 1e-8 }));
    assert!(result.variance.is_finite());
  }

  #[test]
  fn singular_covariance_fails_after_single_retry() {
    // 1e-8 is below the spacing of f64 around 1e12, so the perturbation is absorbed.
    let cov = DMatrix::from_element(2, 2, 1e12);
    let mut opt = MarkowitzOptimizer::new(DVector::from_vec(vec![0.1, 0.2]), cov).unwrap();

    let err = opt.invert_covariance_matrix().unwrap_err();
    assert_eq!(err, MarkowitzError::SingularCovariance { epsilon: 1e-8 });
    assert_eq!(opt.covariance_version(), 1);
    assert_eq!(opt.perturbation(), Some(Perturbation { epsilon: 1e-8 }));
    assert!(matches!(
      opt.design_portfolio_for_return(0.15, false),
      Err(MarkowitzError::SingularCovariance { .. })
    ));
  }

  #[test]
  fn constant_returns_are_degenerate() {
    let (_, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(DVector::from_element(4, 0.07), cov).unwrap();

    assert_eq!(
      opt.design_portfolio_for_return(0.07, true).unwrap_err(),
      MarkowitzError::DegenerateReturnVector
    );
    assert_eq!(
      opt.design_portfolios_for_return(&[0.07, 0.08], false).unwrap_err(),
      MarkowitzError::DegenerateReturnVector
    );
  }

  #[test]
  fn zero_net_return_fund_is_degenerate_in_batch() {
    let mut opt = MarkowitzOptimizer::from_rows(&[0.1, -0.1], &[vec![1.0, 0.0], vec![0.0, 1.0]])
      .unwrap();

    assert!(opt.design_portfolio_for_return(0.05, true).is_ok());
    assert_eq!(
      opt.design_portfolios_for_return(&[0.05], false).unwrap_err(),
      MarkowitzError::DegenerateReturnVector
    );
  }

  #[test]
  fn variance_checks_shape_before_touching_covariance() {
    let cov = DMatrix::from_row_slice(
      3,
      3,
      &[0.04, 0.04, 0.01, 0.04, 0.04, 0.01, 0.01, 0.01, 0.09],
    );
    let mut opt = MarkowitzOptimizer::new(DVector::from_vec(vec![0.05, 0.05, 0.10]), cov).unwrap();

    assert_eq!(
      opt.variance_of_strategy(&DVector::from_vec(vec![1.0]), true).unwrap_err(),
      MarkowitzError::ShapeMismatch {
        what: "allocation",
        expected: 3,
        actual: 1,
      }
    );
    assert_eq!(opt.perturbation(), None);
    assert_eq!(opt.covariance_version(), 0);
  }

  #[test]
  #[traced_test]
  fn variance_survives_failed_inverse_refresh() {
    let cov = DMatrix::from_element(2, 2, 1e12);
    let mut opt = MarkowitzOptimizer::new(DVector::from_vec(vec![0.1, 0.2]), cov).unwrap();
    let w = DVector::from_vec(vec![0.5, 0.5]);

    let variance = opt.variance_of_strategy(&w, true).unwrap();
    assert_relative_eq!(variance, 1e12, max_relative = 1e-12);
    assert!(logs_contain("inverse refresh failed"));
  }

  #[test]
  fn minimum_variance_portfolio_with_constant_returns() {
    let mut opt =
      MarkowitzOptimizer::from_rows(&[0.07, 0.07], &[vec![0.04, 0.0], vec![0.0, 0.09]]).unwrap();

    let gmv = opt.minimum_variance_portfolio().unwrap();
    assert_abs_diff_eq!(gmv.weights[0], 0.09 / 0.13, epsilon = 1e-12);
    assert_abs_diff_eq!(gmv.weights[1], 0.04 / 0.13, epsilon = 1e-12);
    assert_abs_diff_eq!(gmv.expected_return, 0.07, epsilon = 1e-12);
    assert_abs_diff_eq!(gmv.variance, 0.0036 / 0.13, epsilon = 1e-12);

    // The return-constrained paths still reject the same input.
    assert_eq!(
      opt.two_fund_basis().unwrap_err(),
      MarkowitzError::DegenerateReturnVector
    );
  }

  #[test]
  fn batch_rejects_vanishing_return_fund_budget() {
    let cov = DMatrix::identity(2, 2);

    for d in [1e-2, 1e-3, 1e-4, 1e-5] {
      let mut opt = MarkowitzOptimizer::new(DVector::from_vec(vec![0.1, -0.1 + d]), cov.clone())
        .unwrap();
      let batch = opt.design_portfolios_for_return(&[0.05], false).unwrap();
      let single = opt.design_portfolio_for_return(0.05, false).unwrap();
      for i in 0..2 {
        assert_abs_diff_eq!(batch[0][i], single[i], epsilon = 1e-9);
      }
    }

    for d in [1e-8, 1e-10] {
      let mut opt = MarkowitzOptimizer::new(DVector::from_vec(vec![0.1, -0.1 + d]), cov.clone())
        .unwrap();
      assert!(opt.design_portfolio_for_return(0.05, false).is_ok());
      assert_eq!(
        opt.design_portfolios_for_return(&[0.05], false).unwrap_err(),
        MarkowitzError::DegenerateReturnVector
      );
    }
  }

  #[test]
  fn shape_mismatch_fails_fast() {
    assert_eq!(
      MarkowitzOptimizer::new(DVector::from_vec(vec![0.1, 0.2]), DMatrix::identity(3, 3))
        .unwrap_err(),
      MarkowitzError::ShapeMismatch {
        what: "covariance rows",
        expected: 2,
        actual: 3,
      }
    );
    assert_eq!(
      MarkowitzOptimizer::new(DVector::zeros(0), DMatrix::zeros(0, 0)).unwrap_err(),
      MarkowitzError::EmptyUniverse
    );

    let mut opt = two_asset();
    assert!(matches!(
      opt.variance_of_strategy(&DVector::from_vec(vec![1.0]), false),
      Err(MarkowitzError::ShapeMismatch { .. })
    ));
    assert!(matches!(
      opt.set_returns(DVector::from_vec(vec![0.1, 0.2, 0.3])),
      Err(MarkowitzError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn cache_tracks_covariance_changes() {
    let mut opt = two_asset();
    let r = opt.returns().clone();
    let cov = opt.covariance().clone();

    opt.design_portfolio_for_return(0.15, false).unwrap();
    let version = opt.covariance_version();

    opt.update(r.clone(), cov.clone()).unwrap();
    assert_eq!(opt.covariance_version(), version);

    let scaled = &cov * 2.0;
    let w = opt.normal_update(0.15, r, scaled).unwrap();
    assert_eq!(opt.covariance_version(), version + 1);
    assert_abs_diff_eq!(w.variance, 0.065, epsilon = 1e-9);
  }

  #[test]
  fn multi_update_variances_align() {
    let (r, cov) = four_asset();
    let mut opt = MarkowitzOptimizer::new(r.clone(), cov.clone()).unwrap();
    let targets = [0.03, 0.06, 0.09];

    let batch = opt.multi_update(&targets, r.clone(), cov.clone()).unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch.perturbation.is_none());

    for (i, target) in targets.iter().enumerate() {
      let single = opt.normal_update(*target, r.clone(), cov.clone()).unwrap();
      assert_relative_eq!(batch.variances[i], single.variance, max_relative = 1e-9);
    }
  }

  #[test]
  fn non_finite_inputs_are_rejected() {
    let mut opt = two_asset();
    assert_eq!(
      opt.design_portfolio_for_return(f64::NAN, false).unwrap_err(),
      MarkowitzError::NonFinite("target return")
    );
    assert_eq!(
      MarkowitzOptimizer::from_rows(&[0.1, f64::INFINITY], &[vec![1.0, 0.0], vec![0.0, 1.0]])
        .unwrap_err(),
      MarkowitzError::NonFinite("return vector")
    );
  }
}
