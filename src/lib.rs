//! # markowitz
//!
//! $$
//! \mathbf{w}^\* = \lambda\,\Sigma^{-1}\mathbf{r} + \mu\,\Sigma^{-1}\mathbf{e}
//! $$
//!
//! Mean-variance portfolio construction from the analytic two-fund solution.

pub mod error;
pub mod portfolio;

pub use error::MarkowitzError;
pub use error::Result;
pub use portfolio::MarkowitzOptimizer;
pub use portfolio::OptimizerConfig;
