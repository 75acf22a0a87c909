use std::{fs::File, io::BufWriter, path::Path};

use candle_core::{DType, Tensor};
use image::{
  codecs::png::{self, PngEncoder},
  ColorType, ImageEncoder,
};

use crate::error::Result;

/// Writes a `{0,1}` mask tensor of shape `(H,W)` as an 8-bit grayscale PNG,
/// cloud pixels white.
pub fn save_mask(mask: &Tensor, path: impl AsRef<Path>) -> Result<()> {
  let (height, width) = mask.dims2()?;

  let buffer: Vec<u8> = mask
    .to_dtype(DType::U8)?
    .flatten_all()?
    .to_vec1::<u8>()?
    .into_iter()
    .map(|v| if v == 0 { 0 } else { u8::MAX })
    .collect();

  let writer = BufWriter::new(File::create(path)?);

  PngEncoder::new_with_quality(
    writer,
    png::CompressionType::Fast,
    png::FilterType::Adaptive,
  )
  .write_image(&buffer, width as u32, height as u32, ColorType::L8)?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  use candle_core::Device;
  use tempfile::TempDir;

  #[test]
  fn saved_mask_round_trips_through_png() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("mask.png");

    let mask = Tensor::from_vec(vec![0u8, 1, 1, 0], (2, 2), &Device::Cpu).unwrap();
    save_mask(&mask, &path).unwrap();

    let decoded = image::open(&path).unwrap().into_luma8();
    assert_eq!(decoded.dimensions(), (2, 2));
    assert_eq!(decoded.into_raw(), vec![0, 255, 255, 0]);
  }
}
