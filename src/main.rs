use std::fs;
use std::ops::Range;
use std::path::Path;
use std::process::ExitCode;

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use cloudseg_rs::cli::Cli;
use cloudseg_rs::dataset::{BandDirs, CloudDataset};
use cloudseg_rs::error::{Error, Result};
use cloudseg_rs::model::{NetworkSpec, UNet};
use cloudseg_rs::train::{self, TrainOptions};
use cloudseg_rs::{setup, utils};

fn main() -> ExitCode {
  let args = Cli::parse();

  setup::setup_tracing();

  if let Err(err) = run(&args) {
    tracing::error!("{err}");
    return ExitCode::FAILURE;
  }

  ExitCode::SUCCESS
}

fn run(args: &Cli) -> Result<()> {
  setup::setup_args(args)?;

  let device = if args.use_cpu {
    Device::Cpu
  } else {
    Device::cuda_if_available(0)?
  };

  let dataset = CloudDataset::open(BandDirs::under(&args.data_dir), device.clone())?;
  tracing::info!("Indexed {} samples under {}", dataset.len(), args.data_dir.display());

  let eval_end = args.train_count + args.eval_count;

  if eval_end > dataset.len() {
    return Err(Error::config(format!(
      "train_count + eval_count = {eval_end} exceeds the {} indexed samples",
      dataset.len()
    )));
  }

  let spec = NetworkSpec {
    depth: args.depth,
    convs_per_block: args.convs_per_block,
    base_filters: args.base_filters,
    input_size: args.image_size,
    input_channels: if args.no_nir { 3 } else { 4 },
  };

  let varmap = VarMap::new();
  let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
  let model = UNet::new(&spec, vb)?;

  let params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
  tracing::info!(
    "Built U-Net: depth {}, {} convolutional stages, {params} parameters",
    args.depth,
    model.conv_stages()
  );

  tracing::info!("Loading training slice 0..{}", args.train_count);
  let (x_train, y_train) = load_slice(&dataset, 0..args.train_count, args.no_nir)?;
  check_input_size(&x_train, args.image_size)?;

  let opts = TrainOptions {
    epochs: args.epochs,
    batch_size: args.batch_size,
    learning_rate: args.learning_rate,
    validation_split: args.validation_split,
  };
  train::fit(&model, &varmap, &x_train, &y_train, &opts)?;

  if args.eval_count > 0 {
    tracing::info!(
      "Loading evaluation slice {}..{eval_end}",
      args.train_count
    );
    let (x_eval, y_eval) = load_slice(&dataset, args.train_count..eval_end, args.no_nir)?;

    let (loss, acc) = train::evaluate(&model, &x_eval, &y_eval, args.batch_size)?;
    tracing::info!("Held-out slice: loss {loss:.4} acc {acc:.4}");

    if let Some(output_dir) = &args.output_dir {
      export_masks(&model, &x_eval, args, output_dir)?;
    }
  }

  if let Some(path) = &args.weights_out {
    varmap.save(path)?;
    tracing::info!("Saved weights to {}", path.display());
  }

  Ok(())
}

fn load_slice(
  dataset: &CloudDataset,
  range: Range<usize>,
  no_nir: bool,
) -> Result<(Tensor, Tensor)> {
  let (x, y) = dataset.batch(range)?;

  // the canonical sample layout is R,G,B,NIR, so RGB-only is a prefix
  let x = if no_nir { x.narrow(1, 0, 3)? } else { x };

  Ok((x, y))
}

fn check_input_size(x: &Tensor, image_size: usize) -> Result<()> {
  let (_, _, height, width) = x.dims4()?;

  if (height, width) != (image_size, image_size) {
    return Err(Error::config(format!(
      "dataset images are {width}x{height} but image_size is {image_size}"
    )));
  }

  Ok(())
}

fn export_masks(model: &UNet, x_eval: &Tensor, args: &Cli, dir: &Path) -> Result<()> {
  fs::create_dir_all(dir)?;

  let probs = train::predict(model, x_eval, args.batch_size)?;
  let masks = train::threshold(&probs, args.threshold)?;
  let count = masks.dim(0)?;

  for i in 0..count {
    let mask = masks.i(i)?.squeeze(0)?;
    let path = dir.join(format!("sample_{:04}_mask.png", args.train_count + i));
    utils::save_mask(&mask, &path)?;
  }

  tracing::info!("Wrote {count} predicted masks to {}", dir.display());

  Ok(())
}
