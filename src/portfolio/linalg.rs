//! # Linear Algebra Helpers
//!
//! $$
//! \tilde A = DAD,\quad D = \operatorname{diag}(a_{ii}^{-1/2}),\qquad
//! P\tilde A = LU,\qquad \kappa_{\text{pivot}} = \frac{\min_i |U_{ii}|}{\max_i |U_{ii}|}
//! $$
//!
//! LU-based inversion that treats numerically singular matrices as non-invertible. The pivot
//! test runs on the unit-diagonal rescaling, so assets on very different scales are not
//! mistaken for collinear ones.

use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::error::MarkowitzError;
use crate::error::Result;

/// Invert `mat`, returning `None` when it is singular to working precision.
///
/// A matrix is rejected when the LU solve fails, when the pivot ratio of the equilibrated
/// matrix falls below `tolerance`, or when the inverse contains non-finite entries.
pub(crate) fn try_invert(mat: &DMatrix<f64>, tolerance: f64) -> Option<DMatrix<f64>> {
  if mat.is_empty() {
    return None;
  }

  // Rows with a non-positive diagonal are left unscaled.
  let d = mat.diagonal().map(|a| {
    if a.is_finite() && a > 0.0 {
      1.0 / a.sqrt()
    } else {
      1.0
    }
  });
  let n = mat.nrows();
  let scaled = DMatrix::from_fn(n, n, |i, j| mat[(i, j)] * d[i] * d[j]);

  let lu = scaled.lu();
  let pivots = lu.u().diagonal();
  let max_pivot = pivots.iter().fold(0.0_f64, |acc, p| acc.max(p.abs()));
  let min_pivot = pivots.iter().fold(f64::INFINITY, |acc, p| acc.min(p.abs()));

  if !max_pivot.is_finite() || max_pivot == 0.0 || min_pivot <= max_pivot * tolerance {
    return None;
  }

  let scaled_inv = lu.try_inverse()?;
  let inv = DMatrix::from_fn(n, n, |i, j| scaled_inv[(i, j)] * d[i] * d[j]);
  if inv.iter().all(|v| v.is_finite()) {
    Some(inv)
  } else {
    None
  }
}

/// Build a square matrix from row-major rows, rejecting ragged input.
pub(crate) fn square_from_rows(rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
  let n = rows.len();
  if let Some(row) = rows.iter().find(|row| row.len() != n) {
    return Err(MarkowitzError::ShapeMismatch {
      what: "covariance row",
      expected: n,
      actual: row.len(),
    });
  }

  Ok(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
}

pub(crate) fn ensure_finite_vector(v: &DVector<f64>, what: &'static str) -> Result<()> {
  if v.iter().all(|x| x.is_finite()) {
    Ok(())
  } else {
    Err(MarkowitzError::NonFinite(what))
  }
}

pub(crate) fn ensure_finite_matrix(m: &DMatrix<f64>, what: &'static str) -> Result<()> {
  if m.iter().all(|x| x.is_finite()) {
    Ok(())
  } else {
    Err(MarkowitzError::NonFinite(what))
  }
}
