//! Structural validation of produced artifacts.
//!
//! Catches the three failure shapes the external tool exhibits: no output at
//! all, undecodable output, and the "black frame" mode where the file decodes
//! fine but carries no usable content. Pass/fail only; no repair.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Near-uniform, near-black detection thresholds on the 0-255 luma scale.
const DEGENERATE_MEAN_MAX: f64 = 10.0;
const DEGENERATE_VARIANCE_MAX: f64 = 25.0;

/// Upper bound on sampled pixels; large artifacts are strided down to this.
const MAX_SAMPLES: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationVerdict {
    Valid,
    /// Missing or zero-byte file.
    Empty { detail: String },
    /// Exists but cannot be decoded as a raster image.
    Corrupt { detail: String },
    /// Decodes but is content-free (near-uniform, near-black).
    Degenerate { mean: f64, variance: f64 },
}

impl ValidationVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Valid => "valid".to_string(),
            Self::Empty { detail } => format!("empty output ({detail})"),
            Self::Corrupt { detail } => format!("corrupt output ({detail})"),
            Self::Degenerate { mean, variance } => {
                format!("degenerate output (mean luma {mean:.2}, variance {variance:.2})")
            }
        }
    }
}

pub fn validate_artifact(path: &Path) -> ValidationVerdict {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            return ValidationVerdict::Empty {
                detail: format!("{}: {err}", path.display()),
            }
        }
    };
    if size == 0 {
        return ValidationVerdict::Empty {
            detail: format!("{} is zero bytes", path.display()),
        };
    }

    let decoded = match image::open(path) {
        Ok(image) => image,
        Err(err) => {
            return ValidationVerdict::Corrupt {
                detail: err.to_string(),
            }
        }
    };

    let luma = decoded.to_luma8();
    let (mean, variance) = sampled_luma_stats(&luma);
    debug!(
        path = %path.display(),
        mean, variance, "artifact luminance statistics"
    );

    if mean < DEGENERATE_MEAN_MAX && variance < DEGENERATE_VARIANCE_MAX {
        return ValidationVerdict::Degenerate { mean, variance };
    }

    ValidationVerdict::Valid
}

/// Mean and variance of luminance over a strided pixel sample. The stride
/// keeps the cost bounded for poster-sized artifacts while remaining exact
/// for anything small.
fn sampled_luma_stats(luma: &image::GrayImage) -> (f64, f64) {
    let pixels = luma.as_raw();
    let total = pixels.len() as u64;
    let stride = (total / MAX_SAMPLES).max(1) as usize;

    let mut count = 0u64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for value in pixels.iter().step_by(stride) {
        let v = f64::from(*value);
        sum += v;
        sum_sq += v * v;
        count += 1;
    }

    if count == 0 {
        return (0.0, 0.0);
    }
    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n) - mean * mean;
    (mean, variance.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_solid(path: &Path, size: u32, color: [u8; 3]) {
        RgbImage::from_pixel(size, size, Rgb(color))
            .save(path)
            .expect("write fixture image");
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().expect("tempdir");
        let verdict = validate_artifact(&dir.path().join("absent.png"));
        assert!(matches!(verdict, ValidationVerdict::Empty { .. }));
    }

    #[test]
    fn zero_byte_file_is_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("zero.png");
        fs::write(&path, b"").expect("create zero-byte file");
        let verdict = validate_artifact(&path);
        assert!(matches!(verdict, ValidationVerdict::Empty { .. }));
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("garbage.png");
        fs::write(&path, b"not a png at all").expect("write garbage");
        let verdict = validate_artifact(&path);
        assert!(matches!(verdict, ValidationVerdict::Corrupt { .. }));
    }

    #[test]
    fn black_frame_is_degenerate() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("black.png");
        write_solid(&path, 32, [0, 0, 0]);
        match validate_artifact(&path) {
            ValidationVerdict::Degenerate { mean, variance } => {
                assert!(mean < DEGENERATE_MEAN_MAX);
                assert!(variance < DEGENERATE_VARIANCE_MAX);
            }
            other => panic!("expected degenerate, got {other:?}"),
        }
    }

    #[test]
    fn uniform_gray_is_valid() {
        // Uniform but bright: low variance alone must not fail an image.
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("gray.png");
        write_solid(&path, 32, [120, 120, 120]);
        assert!(validate_artifact(&path).is_valid());
    }

    #[test]
    fn dark_but_textured_image_is_valid() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("night.png");
        let mut img = RgbImage::from_pixel(32, 32, Rgb([2, 2, 2]));
        for x in 0..32 {
            img.put_pixel(x, 0, Rgb([200, 200, 200]));
        }
        img.save(&path).expect("write fixture image");
        assert!(validate_artifact(&path).is_valid());
    }

    #[test]
    fn describe_carries_diagnostics() {
        let verdict = ValidationVerdict::Degenerate {
            mean: 1.5,
            variance: 0.2,
        };
        let text = verdict.describe();
        assert!(text.contains("mean luma 1.50"));
    }
}
