use anyhow::Context;
use anyhow::Result;
use markowitz::portfolio::Backtest;
use markowitz::portfolio::BacktestConfig;
use markowitz::portfolio::EqualWeightStrategy;
use markowitz::portfolio::MarkowitzStrategy;
use markowitz::portfolio::OptimizerConfig;
use markowitz::MarkowitzOptimizer;
use nalgebra::DMatrix;
use nalgebra::DVector;
use prettytable::row;
use prettytable::Table;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::Normal;
use tracing_subscriber::EnvFilter;

const N_ASSETS: usize = 6;
const N_STEPS: usize = 500;

/// Daily log-price panel driven by two common factors plus idiosyncratic noise.
fn synthetic_panel(rng: &mut StdRng) -> Result<(DMatrix<f64>, Vec<DMatrix<f64>>)> {
  let noise = Normal::new(0.0, 1.0)?;
  let loadings = DMatrix::from_fn(N_ASSETS, 2, |_, _| 0.01 * noise.sample(rng));
  let drifts = DVector::from_fn(N_ASSETS, |i, _| 0.0002 * (i as f64 + 1.0));

  let mut prices = DMatrix::zeros(N_STEPS + 1, N_ASSETS);
  prices.row_mut(0).fill(100.0);
  for t in 1..=N_STEPS {
    let f = DVector::from_fn(2, |_, _| noise.sample(rng));
    let shock = &loadings * f;
    for j in 0..N_ASSETS {
      let step = drifts[j] + shock[j] + 0.008 * noise.sample(rng);
      prices[(t, j)] = prices[(t - 1, j)] * step.exp();
    }
  }

  let factors = vec![loadings; N_STEPS];
  Ok((prices, factors))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut rng = StdRng::seed_from_u64(42);
  let (prices, factors) = synthetic_panel(&mut rng)?;

  let returns = markowitz::portfolio::derive_returns(&prices)?;
  let r = markowitz::portfolio::mean_returns(&returns)?;
  let cov = markowitz::portfolio::sample_covariance(&returns)?;

  let mut optimizer = MarkowitzOptimizer::new(r.clone(), cov)?;
  let gmv = optimizer
    .minimum_variance_portfolio()
    .context("computing minimum-variance portfolio")?;
  let max_r = r.max();
  let frontier = optimizer.efficient_frontier(gmv.expected_return, max_r, 8)?;

  let mut table = Table::new();
  table.set_titles(row!["target", "volatility", "gross", "weights"]);
  for point in &frontier {
    let gross: f64 = point.weights.iter().map(|w| w.abs()).sum();
    let weights = point
      .weights
      .iter()
      .map(|w| format!("{w:+.3}"))
      .collect::<Vec<_>>()
      .join(" ");
    table.add_row(row![
      format!("{:.5}", point.target_return),
      format!("{:.5}", point.volatility),
      format!("{gross:.3}"),
      weights
    ]);
  }
  println!("Efficient frontier ({N_ASSETS} assets, {N_STEPS} days)");
  table.printstd();

  let backtest = Backtest::new(prices, factors, BacktestConfig::default())?;
  let target = gmv.expected_return + 0.5 * (max_r - gmv.expected_return);
  let mut strategy = MarkowitzStrategy::new(60, target, OptimizerConfig::default())?;
  let markowitz_report = backtest.run(&mut strategy)?;
  let equal_report = backtest.run(&mut EqualWeightStrategy)?;

  println!("Annualized Sharpe, rolling Markowitz: {:.3}", markowitz_report.sharpe);
  println!("Annualized Sharpe, equal weight:      {:.3}", equal_report.sharpe);

  Ok(())
}
