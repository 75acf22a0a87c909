use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, author)]
#[command(about = "U-Net cloud segmentation trainer for multi-band satellite imagery", long_about = None)]
pub struct Cli {
  #[arg(short, long, help = "Dataset root containing the five band directories")]
  #[arg(value_name = "DIR")]
  pub data_dir: PathBuf,

  #[arg(short, long, help = "Directory for predicted mask PNGs")]
  #[arg(value_name = "DIR")]
  pub output_dir: Option<PathBuf>,

  #[arg(short, long, help = "Path for the trained weights (safetensors)")]
  #[arg(value_name = "FILE")]
  pub weights_out: Option<PathBuf>,

  #[arg(long, help = "Number of down/up-sampling stage pairs")]
  #[arg(value_name = "DEPTH", default_value = "5")]
  pub depth: usize,

  #[arg(long, help = "Convolutions per encoder/decoder block")]
  #[arg(value_name = "CONVS", default_value = "1")]
  pub convs_per_block: usize,

  #[arg(long, help = "Channel width of the first stage, doubling per stage")]
  #[arg(value_name = "FILTERS", default_value = "16")]
  pub base_filters: usize,

  #[arg(long, help = "Square input resolution, must be divisible by 2^depth")]
  #[arg(value_name = "SIZE", default_value = "384")]
  pub image_size: usize,

  #[arg(long, help = "Train on RGB only, dropping the near-infrared band")]
  pub no_nir: bool,

  #[arg(short, long, help = "Training epochs")]
  #[arg(value_name = "EPOCHS", default_value = "25")]
  pub epochs: usize,

  #[arg(short, long, help = "Batch size for fit/predict")]
  #[arg(value_name = "BATCH", default_value = "32")]
  pub batch_size: usize,

  #[arg(short, long, help = "AdamW learning rate")]
  #[arg(value_name = "LR", default_value = "0.001")]
  pub learning_rate: f64,

  #[arg(long, help = "Fraction of the training slice held out for validation")]
  #[arg(value_name = "SPLIT", default_value = "0.2")]
  pub validation_split: f64,

  #[arg(long, help = "Number of samples in the training slice")]
  #[arg(value_name = "N", default_value = "1000")]
  pub train_count: usize,

  #[arg(long, help = "Number of samples after the training slice used for evaluation")]
  #[arg(value_name = "N", default_value = "200")]
  pub eval_count: usize,

  #[arg(short, long, help = "Probability threshold for the exported binary masks")]
  #[arg(value_name = "THRESHOLD", default_value = "0.5")]
  pub threshold: f64,

  #[arg(short = 'C', long, help = "Use CPU instead of GPU for training")]
  pub use_cpu: bool,
}
