use candle_core::{DType, Module, Tensor};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::error::{Error, Result};
use crate::model::UNet;

pub struct TrainOptions {
  pub epochs: usize,
  pub batch_size: usize,
  pub learning_rate: f64,
  pub validation_split: f64,
}

impl Default for TrainOptions {
  fn default() -> Self {
    Self {
      epochs: 25,
      batch_size: 32,
      learning_rate: 1e-3,
      validation_split: 0.2,
    }
  }
}

impl TrainOptions {
  pub fn validate(&self) -> Result<()> {
    if self.epochs == 0 {
      return Err(Error::config("epochs must be positive"));
    }

    if self.batch_size == 0 {
      return Err(Error::config("batch_size must be positive"));
    }

    if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
      return Err(Error::config(format!(
        "learning_rate must be positive and finite, got {}",
        self.learning_rate
      )));
    }

    if !(0.0..1.0).contains(&self.validation_split) {
      return Err(Error::config(format!(
        "validation_split must lie in [0, 1), got {}",
        self.validation_split
      )));
    }

    Ok(())
  }
}

/// Per-epoch metrics, one entry per epoch.
#[derive(Debug, Default)]
pub struct History {
  pub loss: Vec<f32>,
  pub val_loss: Vec<f32>,
  pub acc: Vec<f32>,
  pub val_acc: Vec<f32>,
}

/// Trains the model in place with AdamW and binary cross-entropy.
///
/// `x` is `(N,C,H,W)` float images, `y` is `(N,H,W)` integer masks. The tail
/// `validation_split` fraction of the samples is held out and only ever
/// evaluated.
pub fn fit(
  model: &UNet,
  varmap: &VarMap,
  x: &Tensor,
  y: &Tensor,
  opts: &TrainOptions,
) -> Result<History> {
  opts.validate()?;

  let samples = x.dim(0)?;

  if y.dim(0)? != samples {
    return Err(Error::config(format!(
      "got {samples} images but {} masks",
      y.dim(0)?
    )));
  }

  let targets = y.to_dtype(DType::F32)?.unsqueeze(1)?;

  let val_len = (samples as f64 * opts.validation_split) as usize;
  let train_len = samples - val_len;

  if train_len == 0 {
    return Err(Error::config(
      "validation split leaves no training samples",
    ));
  }

  let x_train = x.narrow(0, 0, train_len)?;
  let y_train = targets.narrow(0, 0, train_len)?;

  let validation = if val_len > 0 {
    Some((
      x.narrow(0, train_len, val_len)?,
      targets.narrow(0, train_len, val_len)?,
    ))
  } else {
    None
  };

  let mut optimizer = AdamW::new(
    varmap.all_vars(),
    ParamsAdamW {
      lr: opts.learning_rate,
      ..Default::default()
    },
  )?;

  tracing::info!(
    "Training on {train_len} samples, validating on {val_len}, {} epochs",
    opts.epochs
  );

  let mut history = History::default();

  for epoch in 0..opts.epochs {
    let mut loss_sum = 0f32;
    let mut correct = 0f32;
    let mut pixels = 0usize;

    for start in (0..train_len).step_by(opts.batch_size) {
      let len = opts.batch_size.min(train_len - start);
      let xb = x_train.narrow(0, start, len)?;
      let yb = y_train.narrow(0, start, len)?;

      let logits = model.forward_logits(&xb)?;
      let loss = loss::binary_cross_entropy_with_logit(&logits, &yb)?;
      optimizer.backward_step(&loss)?;

      loss_sum += loss.to_scalar::<f32>()? * len as f32;

      let (batch_correct, batch_pixels) = correct_pixels(&logits.detach(), &yb)?;
      correct += batch_correct;
      pixels += batch_pixels;
    }

    let train_loss = loss_sum / train_len as f32;
    let train_acc = correct / pixels as f32;

    history.loss.push(train_loss);
    history.acc.push(train_acc);

    match &validation {
      Some((x_val, y_val)) => {
        let (val_loss, val_acc) = eval_split(model, x_val, y_val, opts.batch_size)?;
        history.val_loss.push(val_loss);
        history.val_acc.push(val_acc);

        tracing::info!(
          "epoch {}/{}: loss {train_loss:.4} acc {train_acc:.4} val_loss {val_loss:.4} val_acc {val_acc:.4}",
          epoch + 1,
          opts.epochs
        );
      }
      None => {
        tracing::info!(
          "epoch {}/{}: loss {train_loss:.4} acc {train_acc:.4}",
          epoch + 1,
          opts.epochs
        );
      }
    }
  }

  Ok(history)
}

/// Batched sigmoid forward pass, `(N,1,H,W)` probabilities in `[0,1]`.
pub fn predict(model: &UNet, x: &Tensor, batch_size: usize) -> Result<Tensor> {
  if batch_size == 0 {
    return Err(Error::config("batch_size must be positive"));
  }

  let samples = x.dim(0)?;
  let mut outputs = Vec::new();

  for start in (0..samples).step_by(batch_size) {
    let len = batch_size.min(samples - start);
    outputs.push(model.forward(&x.narrow(0, start, len)?)?);
  }

  Ok(Tensor::cat(&outputs, 0)?)
}

/// Loss and thresholded per-pixel accuracy on a held-out slice.
pub fn evaluate(model: &UNet, x: &Tensor, y: &Tensor, batch_size: usize) -> Result<(f32, f32)> {
  if batch_size == 0 {
    return Err(Error::config("batch_size must be positive"));
  }

  let targets = y.to_dtype(DType::F32)?.unsqueeze(1)?;

  eval_split(model, x, &targets, batch_size)
}

/// Binarizes a probability map at `value`, yielding a `{0,1}` mask.
pub fn threshold(probs: &Tensor, value: f64) -> Result<Tensor> {
  if !(0.0..=1.0).contains(&value) {
    return Err(Error::config(format!(
      "threshold must lie in [0, 1], got {value}"
    )));
  }

  Ok(probs.ge(value)?.to_dtype(DType::U8)?)
}

fn eval_split(
  model: &UNet,
  x: &Tensor,
  targets: &Tensor,
  batch_size: usize,
) -> Result<(f32, f32)> {
  let samples = x.dim(0)?;
  let mut loss_sum = 0f32;
  let mut correct = 0f32;
  let mut pixels = 0usize;

  for start in (0..samples).step_by(batch_size) {
    let len = batch_size.min(samples - start);
    let xb = x.narrow(0, start, len)?;
    let yb = targets.narrow(0, start, len)?;

    let logits = model.forward_logits(&xb)?.detach();
    let loss = loss::binary_cross_entropy_with_logit(&logits, &yb)?;

    loss_sum += loss.to_scalar::<f32>()? * len as f32;

    let (batch_correct, batch_pixels) = correct_pixels(&logits, &yb)?;
    correct += batch_correct;
    pixels += batch_pixels;
  }

  Ok((loss_sum / samples as f32, correct / pixels as f32))
}

// sigmoid(z) >= 0.5 exactly when z >= 0, so the 0.5 threshold can be applied
// to the logits directly.
fn correct_pixels(logits: &Tensor, targets: &Tensor) -> Result<(f32, usize), candle_core::Error> {
  let predicted = logits.ge(0.0)?;
  let truth = targets.ge(0.5)?;
  let matches = predicted.eq(&truth)?;
  let correct = matches.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;

  Ok((correct, matches.elem_count()))
}

#[cfg(test)]
mod tests {
  use super::*;

  use candle_core::Device;
  use candle_nn::VarBuilder;

  use crate::model::NetworkSpec;

  fn tiny_model() -> (UNet, VarMap) {
    let spec = NetworkSpec {
      depth: 1,
      convs_per_block: 1,
      base_filters: 2,
      input_size: 8,
      input_channels: 4,
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = UNet::new(&spec, vb).unwrap();

    (model, varmap)
  }

  fn tiny_data(samples: usize) -> (Tensor, Tensor) {
    let x = Tensor::randn(0f32, 1.0, (samples, 4, 8, 8), &Device::Cpu).unwrap();
    let y: Vec<i64> = (0..samples * 8 * 8).map(|i| (i % 3 == 0) as i64).collect();
    let y = Tensor::from_vec(y, (samples, 8, 8), &Device::Cpu).unwrap();

    (x, y)
  }

  #[test]
  fn fit_records_one_entry_per_epoch() {
    let (model, varmap) = tiny_model();
    let (x, y) = tiny_data(4);

    let opts = TrainOptions {
      epochs: 2,
      batch_size: 2,
      learning_rate: 1e-3,
      validation_split: 0.25,
    };
    let history = fit(&model, &varmap, &x, &y, &opts).unwrap();

    assert_eq!(history.loss.len(), 2);
    assert_eq!(history.acc.len(), 2);
    assert_eq!(history.val_loss.len(), 2);
    assert_eq!(history.val_acc.len(), 2);
    assert!(history.loss.iter().all(|l| l.is_finite()));
    assert!(history.val_loss.iter().all(|l| l.is_finite()));
    assert!(history.acc.iter().all(|&a| (0.0..=1.0).contains(&a)));
  }

  #[test]
  fn fit_without_validation_split() {
    let (model, varmap) = tiny_model();
    let (x, y) = tiny_data(2);

    let opts = TrainOptions {
      epochs: 1,
      batch_size: 2,
      learning_rate: 1e-3,
      validation_split: 0.0,
    };
    let history = fit(&model, &varmap, &x, &y, &opts).unwrap();

    assert_eq!(history.loss.len(), 1);
    assert!(history.val_loss.is_empty());
  }

  #[test]
  fn predict_yields_probabilities() {
    let (model, _varmap) = tiny_model();
    let (x, _y) = tiny_data(3);

    let probs = predict(&model, &x, 2).unwrap();
    assert_eq!(probs.dims4().unwrap(), (3, 1, 8, 8));

    let values = probs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|&v| (0.0..=1.0).contains(&v)));
  }

  #[test]
  fn evaluate_reports_finite_metrics() {
    let (model, _varmap) = tiny_model();
    let (x, y) = tiny_data(3);

    let (loss, acc) = evaluate(&model, &x, &y, 2).unwrap();
    assert!(loss.is_finite());
    assert!((0.0..=1.0).contains(&acc));
  }

  #[test]
  fn threshold_binarizes() {
    let probs = Tensor::from_vec(vec![0.1f32, 0.5, 0.9, 0.49], (1, 1, 2, 2), &Device::Cpu).unwrap();
    let mask = threshold(&probs, 0.5).unwrap();
    let values = mask.flatten_all().unwrap().to_vec1::<u8>().unwrap();

    assert_eq!(values, vec![0, 1, 1, 0]);
    assert!(threshold(&probs, 1.5).is_err());
  }

  #[test]
  fn invalid_options_are_rejected() {
    for bad in [
      TrainOptions {
        epochs: 0,
        ..TrainOptions::default()
      },
      TrainOptions {
        batch_size: 0,
        ..TrainOptions::default()
      },
      TrainOptions {
        learning_rate: 0.0,
        ..TrainOptions::default()
      },
      TrainOptions {
        validation_split: 1.0,
        ..TrainOptions::default()
      },
    ] {
      assert!(bad.validate().is_err());
    }
  }
}
