use candle_core::{Module, Tensor};
use candle_nn::{conv2d, ops::sigmoid, Conv2d, Conv2dConfig, VarBuilder};

use super::NetworkSpec;
use crate::error::Result;

/// `convs_per_block` same-padded 3x3 convolutions, ReLU after each.
struct ConvBlock {
  convs: Vec<Conv2d>,
}

impl ConvBlock {
  fn new(
    in_channels: usize,
    out_channels: usize,
    count: usize,
    vb: VarBuilder,
  ) -> Result<Self, candle_core::Error> {
    let mut convs = Vec::with_capacity(count);
    let mut channels = in_channels;

    for i in 0..count {
      convs.push(conv2d(
        channels,
        out_channels,
        3,
        Conv2dConfig {
          padding: 1,
          ..Default::default()
        },
        vb.pp(format!("conv{i}")),
      )?);

      channels = out_channels;
    }

    Ok(Self { convs })
  }
}

impl Module for ConvBlock {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let mut x = x.clone();

    for conv in &self.convs {
      x = conv.forward(&x)?.relu()?;
    }

    Ok(x)
  }
}

/// Symmetric encoder-decoder with skip connections.
///
/// Encoder stage `i` runs its convolution block at `base_filters * 2^i`,
/// keeps the pre-pooling activation as a skip tensor and halves the
/// resolution with a 2x2 max-pool. The bottleneck runs one more block at
/// `base_filters * 2^depth`. Decoder stage `i` upsamples by 2
/// (nearest-neighbor), concatenates the mirrored skip tensor on the channel
/// axis and runs its block back down to `base_filters * 2^i`. A 1x1
/// convolution with sigmoid produces the per-pixel cloud probability.
pub struct UNet {
  down: Vec<ConvBlock>,
  bottleneck: ConvBlock,
  up: Vec<ConvBlock>,
  head: Conv2d,
}

impl UNet {
  pub fn new(spec: &NetworkSpec, vb: VarBuilder) -> Result<Self> {
    spec.validate()?;

    let mut down = Vec::with_capacity(spec.depth);
    let mut channels = spec.input_channels;

    for i in 0..spec.depth {
      down.push(ConvBlock::new(
        channels,
        spec.filters_at(i),
        spec.convs_per_block,
        vb.pp(format!("down{i}")),
      )?);

      channels = spec.filters_at(i);
    }

    let bottleneck = ConvBlock::new(
      channels,
      spec.filters_at(spec.depth),
      spec.convs_per_block,
      vb.pp("bottleneck"),
    )?;

    // Decoder blocks in application order, deepest first. After upsampling,
    // the input carries the previous stage's channels plus the skip tensor's.
    let mut up = Vec::with_capacity(spec.depth);
    let mut channels = spec.filters_at(spec.depth);

    for i in (0..spec.depth).rev() {
      up.push(ConvBlock::new(
        channels + spec.filters_at(i),
        spec.filters_at(i),
        spec.convs_per_block,
        vb.pp(format!("up{i}")),
      )?);

      channels = spec.filters_at(i);
    }

    let head = conv2d(channels, 1, 1, Conv2dConfig::default(), vb.pp("head"))?;

    Ok(Self {
      down,
      bottleneck,
      up,
      head,
    })
  }

  /// Pre-sigmoid probability map, `(N,1,H,W)`. The training loss applies
  /// its own sigmoid, so it consumes this rather than `forward`.
  pub fn forward_logits(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    let mut x = x.clone();
    let mut skips = Vec::with_capacity(self.down.len());

    for block in &self.down {
      let c = block.forward(&x)?;
      x = c.max_pool2d(2)?;
      skips.push(c);
    }

    x = self.bottleneck.forward(&x)?;

    for (block, skip) in self.up.iter().zip(skips.iter().rev()) {
      let (_, _, height, width) = x.dims4()?;
      x = x.upsample_nearest2d(height * 2, width * 2)?;
      x = Tensor::cat(&[&x, skip], 1)?;
      x = block.forward(&x)?;
    }

    self.head.forward(&x)
  }

  /// Total number of convolution layers, head included.
  pub fn conv_stages(&self) -> usize {
    self
      .down
      .iter()
      .chain(std::iter::once(&self.bottleneck))
      .chain(&self.up)
      .map(|block| block.convs.len())
      .sum::<usize>()
      + 1
  }
}

impl Module for UNet {
  fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
    sigmoid(&self.forward_logits(x)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use candle_core::{DType, Device};
  use candle_nn::VarMap;

  fn build(spec: &NetworkSpec) -> (UNet, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = UNet::new(spec, vb).unwrap();

    (model, varmap)
  }

  fn small_spec() -> NetworkSpec {
    NetworkSpec {
      depth: 2,
      convs_per_block: 2,
      base_filters: 4,
      input_size: 16,
      input_channels: 4,
    }
  }

  #[test]
  fn output_spatial_shape_matches_input() {
    let spec = small_spec();
    let (model, _varmap) = build(&spec);

    let x = Tensor::randn(0f32, 1.0, (2, 4, 16, 16), &Device::Cpu).unwrap();
    let y = model.forward(&x).unwrap();

    assert_eq!(y.dims4().unwrap(), (2, 1, 16, 16));

    let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|&v| (0.0..=1.0).contains(&v)));
  }

  #[test]
  fn single_conv_depth_five_has_twelve_stages() {
    let spec = NetworkSpec {
      depth: 5,
      convs_per_block: 1,
      base_filters: 16,
      input_size: 384,
      input_channels: 4,
    };
    let (model, _varmap) = build(&spec);

    assert_eq!(model.down.len(), 5);
    assert_eq!(model.up.len(), 5);
    assert_eq!(model.conv_stages(), 12);
  }

  #[test]
  fn double_conv_doubles_block_stages() {
    let (model, _varmap) = build(&small_spec());

    // 2 down blocks + bottleneck + 2 up blocks, 2 convs each, plus the head
    assert_eq!(model.conv_stages(), 11);
  }

  #[test]
  fn same_spec_builds_identical_structure() {
    let spec = small_spec();
    let (a, vars_a) = build(&spec);
    let (b, vars_b) = build(&spec);

    assert_eq!(a.conv_stages(), b.conv_stages());
    assert_eq!(vars_a.all_vars().len(), vars_b.all_vars().len());
  }

  #[test]
  fn invalid_spec_fails_before_any_layer_exists() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let bad = NetworkSpec {
      input_size: 100,
      depth: 5,
      convs_per_block: 1,
      base_filters: 16,
      input_channels: 4,
    };

    assert!(UNet::new(&bad, vb).is_err());
    assert!(varmap.all_vars().is_empty());
  }

  #[test]
  fn decoder_halves_concatenated_channels() {
    let spec = small_spec();
    let (model, _varmap) = build(&spec);

    // deepest decoder block consumes bottleneck output plus its skip tensor
    assert_eq!(model.up[0].convs[0].weight().dims4().unwrap().1, 16 + 8);
  }
}
