mod unet;

pub use unet::*;

use crate::error::{Error, Result};

/// Structural parameters of the encoder-decoder graph.
///
/// `depth` down/up stage pairs, `convs_per_block` convolutions per stage,
/// channel widths starting at `base_filters` and doubling at each deeper
/// stage. Pure configuration, two models built from the same spec share
/// structure but not weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSpec {
  pub depth: usize,
  pub convs_per_block: usize,
  pub base_filters: usize,
  pub input_size: usize,
  pub input_channels: usize,
}

impl NetworkSpec {
  pub fn validate(&self) -> Result<()> {
    if self.depth == 0 {
      return Err(Error::config("depth must be positive"));
    }

    if self.depth >= usize::BITS as usize {
      return Err(Error::config(format!(
        "depth {} is too large, filter widths would overflow",
        self.depth
      )));
    }

    if self.convs_per_block == 0 {
      return Err(Error::config("convs_per_block must be positive"));
    }

    if self.base_filters == 0 {
      return Err(Error::config("base_filters must be positive"));
    }

    if self.input_channels == 0 {
      return Err(Error::config("input_channels must be positive"));
    }

    if self.input_size == 0 {
      return Err(Error::config("input_size must be positive"));
    }

    // Pooling halves the resolution `depth` times; anything not divisible by
    // 2^depth breaks the skip concatenation on the way back up.
    let factor = 1usize << self.depth;

    if self.input_size % factor != 0 {
      return Err(Error::config(format!(
        "input_size {} is not divisible by 2^depth = {factor}",
        self.input_size
      )));
    }

    Ok(())
  }

  /// Filter width of stage `i`: `base_filters * 2^i`.
  pub(crate) fn filters_at(&self, stage: usize) -> usize {
    self.base_filters << stage
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spec() -> NetworkSpec {
    NetworkSpec {
      depth: 5,
      convs_per_block: 1,
      base_filters: 16,
      input_size: 384,
      input_channels: 4,
    }
  }

  #[test]
  fn valid_spec_passes() {
    assert!(spec().validate().is_ok());
  }

  #[test]
  fn indivisible_input_size_is_rejected() {
    // 100 is not divisible by 2^5
    let bad = NetworkSpec {
      input_size: 100,
      ..spec()
    };
    assert!(matches!(
      bad.validate().unwrap_err(),
      Error::Configuration(_)
    ));
  }

  #[test]
  fn non_positive_fields_are_rejected() {
    for bad in [
      NetworkSpec { depth: 0, ..spec() },
      NetworkSpec {
        convs_per_block: 0,
        ..spec()
      },
      NetworkSpec {
        base_filters: 0,
        ..spec()
      },
      NetworkSpec {
        input_channels: 0,
        ..spec()
      },
      NetworkSpec {
        input_size: 0,
        ..spec()
      },
    ] {
      assert!(bad.validate().is_err());
    }
  }

  #[test]
  fn filter_widths_double_per_stage() {
    let spec = spec();
    assert_eq!(spec.filters_at(0), 16);
    assert_eq!(spec.filters_at(1), 32);
    assert_eq!(spec.filters_at(5), 512);
  }
}
