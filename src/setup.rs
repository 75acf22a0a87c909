use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::cli::Cli;
use crate::error::{Error, Result};

pub fn setup_tracing() {
  let subscriber = FmtSubscriber::builder()
    .with_max_level(Level::INFO)
    .with_target(false)
    .finish();

  tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");
}

pub fn setup_args(args: &Cli) -> Result<()> {
  if !args.data_dir.is_dir() {
    return Err(Error::config(format!(
      "data directory does not exist: {}",
      args.data_dir.display()
    )));
  }

  if args.train_count == 0 {
    return Err(Error::config("train_count must be positive"));
  }

  if !(0.0..=1.0).contains(&args.threshold) {
    return Err(Error::config(format!(
      "threshold must lie in [0, 1], got {}",
      args.threshold
    )));
  }

  if args.eval_count == 0 && args.output_dir.is_some() {
    tracing::warn!("Mask export needs an evaluation slice! Ignoring `--output-dir`...");
  }

  Ok(())
}
