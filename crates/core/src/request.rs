//! The immutable per-run request object submitted by the caller, plus the
//! small enums it is built from.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// ISO A-series paper sizes supported for print output.
///
/// The inch dimensions are the fixed table the geometry resolver works from
/// (portrait-major, already rounded to 0.1").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperSize {
    A0,
    A1,
    A2,
    A3,
    A4,
}

impl PaperSize {
    pub const ALL: [PaperSize; 5] = [Self::A0, Self::A1, Self::A2, Self::A3, Self::A4];

    /// (width, height) in inches, portrait orientation.
    pub fn inches(self) -> (f64, f64) {
        match self {
            Self::A0 => (33.1, 46.8),
            Self::A1 => (23.4, 33.1),
            Self::A2 => (16.5, 23.4),
            Self::A3 => (11.7, 16.5),
            Self::A4 => (8.3, 11.7),
        }
    }
}

impl std::fmt::Display for PaperSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::A0 => "a0",
            Self::A1 => "a1",
            Self::A2 => "a2",
            Self::A3 => "a3",
            Self::A4 => "a4",
        };
        f.write_str(name)
    }
}

impl FromStr for PaperSize {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "a0" => Ok(Self::A0),
            "a1" => Ok(Self::A1),
            "a2" => Ok(Self::A2),
            "a3" => Ok(Self::A3),
            "a4" => Ok(Self::A4),
            other => Err(format!("unrecognized paper size '{other}' (expected a0..a4)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Portrait => f.write_str("portrait"),
            Self::Landscape => f.write_str("landscape"),
        }
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "portrait" => Ok(Self::Portrait),
            "landscape" => Ok(Self::Landscape),
            other => Err(format!(
                "unrecognized orientation '{other}' (expected portrait or landscape)"
            )),
        }
    }
}

/// Numeric precision the external upscaler runs at. `Fp16` is the
/// high-throughput mode; `Fp32` is the full-precision fallback the retry
/// ladder degrades to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp16,
    Fp32,
}

impl Precision {
    pub fn is_high_throughput(self) -> bool {
        matches!(self, Self::Fp16)
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp16 => f.write_str("fp16"),
            Self::Fp32 => f.write_str("fp32"),
        }
    }
}

/// Everything one upscale run needs. Built once per submission and never
/// mutated afterwards; the pipeline derives all further state from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleRequest {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub paper: PaperSize,
    pub dpi: u32,
    pub orientation: Orientation,
    pub exe: PathBuf,
    pub models_dir: PathBuf,
    pub model: String,
    /// User tile-size preference; clamped into the safe range before use.
    pub tile_size: i64,
    pub precision: Precision,
    /// Skip upscaling entirely and emit the source at its native pixel size.
    pub keep_native: bool,
    /// Acknowledges the cost of the highest DPI tier (see `dpi` module).
    pub force_max_dpi: bool,
}
