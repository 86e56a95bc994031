//! Equalizer settings passed to engines at startup.

use std::fmt;

use thiserror::Error;

/// Number of bands the engine's equalizer filter expects.
pub const BAND_COUNT: usize = 10;

/// Accepted gain range per band, in dB.
pub const GAIN_RANGE: std::ops::RangeInclusive<f32> = -20.0..=20.0;

/// Preamp applied when none is configured.
pub const DEFAULT_PREAMP: i32 = 12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EqualizerError {
  #[error("Expected 10 bands, got {0}")]
  BandCount(usize),
  #[error("Invalid band value: {0:?}")]
  InvalidBand(String),
  #[error("Band gain {0} dB out of range")]
  OutOfRange(f32),
}

/// Band gains plus preamp. Engines only read these at launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Equalizer {
  bands: [f32; BAND_COUNT],
  preamp: i32,
}

impl Default for Equalizer {
  fn default() -> Self {
    Self {
      bands: [0.0; BAND_COUNT],
      preamp: DEFAULT_PREAMP,
    }
  }
}

impl Equalizer {
  pub fn new(bands: [f32; BAND_COUNT], preamp: i32) -> Result<Self, EqualizerError> {
    if let Some(bad) = bands.iter().find(|b| !GAIN_RANGE.contains(*b)) {
      return Err(EqualizerError::OutOfRange(*bad));
    }
    Ok(Self { bands, preamp })
  }

  /// Parse a whitespace-separated band string such as `"0 3 -2 0 0 0 0 0 0 0"`.
  pub fn parse(bands: &str, preamp: i32) -> Result<Self, EqualizerError> {
    let values = bands
      .split_whitespace()
      .map(|s| {
        s.parse::<f32>()
          .map_err(|_| EqualizerError::InvalidBand(s.to_string()))
      })
      .collect::<Result<Vec<_>, _>>()?;

    let parsed: [f32; BAND_COUNT] = values
      .as_slice()
      .try_into()
      .map_err(|_| EqualizerError::BandCount(values.len()))?;
    Self::new(parsed, preamp)
  }

  pub fn bands(&self) -> &[f32; BAND_COUNT] {
    &self.bands
  }

  pub fn preamp(&self) -> i32 {
    self.preamp
  }

  /// The band string handed to the engine's `--equalizer-bands` flag.
  pub fn band_string(&self) -> String {
    self
      .bands
      .iter()
      .map(|b| b.to_string())
      .collect::<Vec<_>>()
      .join(" ")
  }
}

impl fmt::Display for Equalizer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] preamp {}", self.band_string(), self.preamp)
  }
}
