use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::error::{Error, Result};

/// The five sibling directories holding one single-channel file per sample.
pub struct BandDirs {
  pub red: PathBuf,
  pub green: PathBuf,
  pub blue: PathBuf,
  pub nir: PathBuf,
  pub gt: PathBuf,
}

impl BandDirs {
  /// Standard 38-Cloud layout: `train_red`, `train_green`, ... under one root.
  pub fn under(root: impl AsRef<Path>) -> Self {
    let root = root.as_ref();

    Self {
      red: root.join("train_red"),
      green: root.join("train_green"),
      blue: root.join("train_blue"),
      nir: root.join("train_nir"),
      gt: root.join("train_gt"),
    }
  }
}

#[derive(Debug)]
struct SampleFiles {
  red: PathBuf,
  green: PathBuf,
  blue: PathBuf,
  nir: PathBuf,
  gt: PathBuf,
}

impl SampleFiles {
  fn band(&self, band: &'static str) -> &Path {
    match band {
      "red" => &self.red,
      "green" => &self.green,
      "blue" => &self.blue,
      "nir" => &self.nir,
      _ => &self.gt,
    }
  }
}

/// An indexable collection of (image, mask) tensor pairs backed by five band
/// directories whose filenames differ only in the band token.
///
/// The file index is built once at `open` and is immutable afterwards; image
/// and mask tensors are decoded from disk on every access.
#[derive(Debug)]
pub struct CloudDataset {
  files: Vec<SampleFiles>,
  device: Device,
}

const MASK_CLOUD_VALUE: u16 = 255;

impl CloudDataset {
  pub fn open(dirs: BandDirs, device: Device) -> Result<Self> {
    for (band, dir) in [
      ("red", &dirs.red),
      ("green", &dirs.green),
      ("blue", &dirs.blue),
      ("nir", &dirs.nir),
      ("gt", &dirs.gt),
    ] {
      if !dir.is_dir() {
        return Err(Error::config(format!(
          "{band} band directory does not exist: {}",
          dir.display()
        )));
      }
    }

    let mut red_files = Vec::new();

    for entry in fs::read_dir(&dirs.red)? {
      let path = entry?.path();

      if path.is_dir() {
        continue;
      }

      red_files.push(path);
    }

    // Directory iteration order is platform-dependent, sample indices are not.
    red_files.sort();

    let mut files = Vec::with_capacity(red_files.len());

    for red in red_files {
      files.push(Self::combine_bands(red, &dirs)?);
    }

    Ok(Self { files, device })
  }

  /// Derives the other four band paths from a red-band path by substituting
  /// the band token, failing fast on ambiguous names or absent files.
  fn combine_bands(red: PathBuf, dirs: &BandDirs) -> Result<SampleFiles> {
    let Some(name) = red.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
      return Err(Error::config(format!(
        "red band filename is not valid UTF-8: {}",
        red.display()
      )));
    };

    match name.matches("red").count() {
      1 => {}
      0 => {
        return Err(Error::config(format!(
          "red band filename does not contain the band token `red`: {name}"
        )))
      }
      n => {
        return Err(Error::config(format!(
          "band token `red` appears {n} times in {name}, substitution is ambiguous"
        )))
      }
    }

    let derive = |dir: &Path, band: &str| dir.join(name.replace("red", band));

    let files = SampleFiles {
      green: derive(&dirs.green, "green"),
      blue: derive(&dirs.blue, "blue"),
      nir: derive(&dirs.nir, "nir"),
      gt: derive(&dirs.gt, "gt"),
      red,
    };

    for band in ["green", "blue", "nir", "gt"] {
      let path = files.band(band);

      if !path.is_file() {
        return Err(Error::MissingFile {
          band,
          red_file: name.to_owned(),
          path: path.to_owned(),
        });
      }
    }

    Ok(files)
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  fn sample_files(&self, index: usize) -> Result<&SampleFiles> {
    self.files.get(index).ok_or(Error::IndexOutOfRange {
      index,
      len: self.files.len(),
    })
  }

  /// Normalized floating-point image tensor for one sample.
  ///
  /// Channels are `{R,G,B}` or `{R,G,B,NIR}`, each divided by the maximum
  /// value of the source integer pixel type, laid out `(C,H,W)` when
  /// `channel_first` and `(H,W,C)` otherwise.
  pub fn image(&self, index: usize, include_nir: bool, channel_first: bool) -> Result<Tensor> {
    let files = self.sample_files(index)?;

    let bands: &[&'static str] = if include_nir {
      &["red", "green", "blue", "nir"]
    } else {
      &["red", "green", "blue"]
    };

    let mut rasters = Vec::with_capacity(bands.len());

    for &band in bands {
      let raster = Raster::open(files.band(band))?;

      if let Some(first) = rasters.first() {
        raster.check_dims(first, index, band)?;
      }

      rasters.push(raster);
    }

    let (width, height) = (rasters[0].width as usize, rasters[0].height as usize);
    let channels: Vec<Vec<f32>> = rasters.iter().map(Raster::normalized).collect();
    let mut data = Vec::with_capacity(channels.len() * width * height);

    if channel_first {
      for channel in &channels {
        data.extend_from_slice(channel);
      }

      Ok(Tensor::from_vec(
        data,
        (channels.len(), height, width),
        &self.device,
      )?)
    } else {
      for pixel in 0..width * height {
        for channel in &channels {
          data.push(channel[pixel]);
        }
      }

      Ok(Tensor::from_vec(
        data,
        (height, width, channels.len()),
        &self.device,
      )?)
    }
  }

  /// Binarized ground-truth tensor: `1` where the label pixel equals 255,
  /// `0` elsewhere, as 64-bit integers.
  pub fn mask(&self, index: usize, add_leading_dim: bool) -> Result<Tensor> {
    let files = self.sample_files(index)?;
    let raster = Raster::open(&files.gt)?;
    let (width, height) = (raster.width as usize, raster.height as usize);
    let data = raster.binarized();

    let mask = if add_leading_dim {
      Tensor::from_vec(data, (1, height, width), &self.device)?
    } else {
      Tensor::from_vec(data, (height, width), &self.device)?
    };

    Ok(mask)
  }

  /// The canonical training pair: channel-first RGB+NIR image and a flat
  /// integer mask, cross-checked for matching spatial dimensions.
  pub fn sample(&self, index: usize) -> Result<(Tensor, Tensor)> {
    let image = self.image(index, true, true)?;
    let mask = self.mask(index, false)?;

    let (_, height, width) = image.dims3()?;
    let (mask_height, mask_width) = mask.dims2()?;

    if (mask_height, mask_width) != (height, width) {
      return Err(Error::ShapeMismatch {
        index,
        band: "gt",
        found_width: mask_width as u32,
        found_height: mask_height as u32,
        expected_width: width as u32,
        expected_height: height as u32,
      });
    }

    Ok((image, mask))
  }

  /// Stacks a contiguous index range into `(N,C,H,W)` image and `(N,H,W)`
  /// mask tensors ready for `fit`/`predict`.
  pub fn batch(&self, range: Range<usize>) -> Result<(Tensor, Tensor)> {
    if range.is_empty() {
      return Err(Error::config(format!(
        "empty sample range {}..{}",
        range.start, range.end
      )));
    }

    let mut images = Vec::with_capacity(range.len());
    let mut masks = Vec::with_capacity(range.len());

    for index in range {
      let (image, mask) = self.sample(index)?;
      images.push(image);
      masks.push(mask);
    }

    Ok((Tensor::stack(&images, 0)?, Tensor::stack(&masks, 0)?))
  }
}

/// One decoded single-channel file, kept in its source integer type so both
/// normalization and the exact-value mask rule can see the raw pixels.
struct Raster {
  width: u32,
  height: u32,
  pixels: Pixels,
}

enum Pixels {
  U8(Vec<u8>),
  U16(Vec<u16>),
}

impl Raster {
  fn open(path: &Path) -> Result<Self> {
    let (width, height, pixels) = match image::open(path)? {
      DynamicImage::ImageLuma8(img) => (img.width(), img.height(), Pixels::U8(img.into_raw())),
      DynamicImage::ImageLuma16(img) => (img.width(), img.height(), Pixels::U16(img.into_raw())),
      _ => {
        return Err(Error::UnsupportedPixelFormat {
          path: path.to_owned(),
        })
      }
    };

    Ok(Self {
      width,
      height,
      pixels,
    })
  }

  fn check_dims(&self, expected: &Raster, index: usize, band: &'static str) -> Result<()> {
    if (self.width, self.height) != (expected.width, expected.height) {
      return Err(Error::ShapeMismatch {
        index,
        band,
        found_width: self.width,
        found_height: self.height,
        expected_width: expected.width,
        expected_height: expected.height,
      });
    }

    Ok(())
  }

  fn normalized(&self) -> Vec<f32> {
    match &self.pixels {
      Pixels::U8(pixels) => pixels
        .iter()
        .map(|&v| f32::from(v) / f32::from(u8::MAX))
        .collect(),
      Pixels::U16(pixels) => pixels
        .iter()
        .map(|&v| f32::from(v) / f32::from(u16::MAX))
        .collect(),
    }
  }

  fn binarized(&self) -> Vec<i64> {
    match &self.pixels {
      Pixels::U8(pixels) => pixels
        .iter()
        .map(|&v| i64::from(u16::from(v) == MASK_CLOUD_VALUE))
        .collect(),
      Pixels::U16(pixels) => pixels
        .iter()
        .map(|&v| i64::from(v == MASK_CLOUD_VALUE))
        .collect(),
    }
  }
}
