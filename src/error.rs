use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("sample index {index} is out of range, the dataset holds {len} samples")]
  IndexOutOfRange { index: usize, len: usize },

  #[error("missing {band} band file for {red_file}: {path}")]
  MissingFile {
    band: &'static str,
    red_file: String,
    path: PathBuf,
  },

  #[error("invalid configuration: {0}")]
  Configuration(String),

  #[error(
    "shape mismatch in sample {index}: {band} band is {found_width}x{found_height}, \
     expected {expected_width}x{expected_height}"
  )]
  ShapeMismatch {
    index: usize,
    band: &'static str,
    found_width: u32,
    found_height: u32,
    expected_width: u32,
    expected_height: u32,
  },

  #[error("unsupported pixel format in {path}: expected single-channel 8- or 16-bit integers")]
  UnsupportedPixelFormat { path: PathBuf },

  #[error(transparent)]
  Image(#[from] image::ImageError),

  #[error(transparent)]
  Candle(#[from] candle_core::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn config(msg: impl Into<String>) -> Self {
    Error::Configuration(msg.into())
  }
}
