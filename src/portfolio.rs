//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Closed-form mean-variance optimization, with the preprocessing, strategy and backtest
//! pieces that feed it and consume its allocations.

pub mod backtest;
pub mod data;
mod linalg;
pub mod markowitz;
pub mod strategy;
pub mod types;

pub use backtest::Backtest;
pub use backtest::BacktestConfig;
pub use backtest::BacktestReport;
pub use data::derive_returns;
pub use data::log_returns;
pub use data::mean_returns;
pub use data::Preprocessing;
pub use data::sample_covariance;
pub use data::StandardScaler;
pub use markowitz::MarkowitzOptimizer;
pub use strategy::AllocationStrategy;
pub use strategy::EqualWeightStrategy;
pub use strategy::MarkowitzStrategy;
pub use types::FrontierPoint;
pub use types::MinimumVariancePortfolio;
pub use types::OptimizerConfig;
pub use types::Perturbation;
pub use types::PortfolioAllocation;
pub use types::PortfolioBatch;
pub use types::TwoFundBasis;
pub use types::DEFAULT_EPSILON;
