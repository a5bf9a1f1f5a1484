//! Maps a (paper size, DPI, orientation) tuple plus the source pixel size to
//! the exact target raster dimensions and the scale factor the upscale
//! passes must cover.

use serde::{Deserialize, Serialize};

use crate::dpi;
use crate::error::PipelineError;
use crate::request::{Orientation, PaperSize};

/// Derived once at run start, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetGeometry {
    pub width: u32,
    pub height: u32,
    /// Required growth of the source's longer edge, floored at 1.0. A source
    /// that already meets or exceeds the target needs no AI passes; the
    /// compositor alone reconciles the difference.
    pub scale: f64,
}

impl TargetGeometry {
    pub fn longer_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// Target pixels for a paper sheet at a given DPI, before orientation swap.
fn sheet_pixels(paper: PaperSize, dpi: u32) -> (u32, u32) {
    let (w_in, h_in) = paper.inches();
    let w = (w_in * f64::from(dpi)).round() as u32;
    let h = (h_in * f64::from(dpi)).round() as u32;
    (w, h)
}

pub fn resolve(
    paper: PaperSize,
    dpi: u32,
    orientation: Orientation,
    source: (u32, u32),
    keep_native: bool,
) -> Result<TargetGeometry, PipelineError> {
    if !(dpi::DPI_MIN..=dpi::DPI_MAX).contains(&dpi) {
        return Err(PipelineError::InvalidGeometry(format!(
            "DPI {dpi} outside supported range {}-{}",
            dpi::DPI_MIN,
            dpi::DPI_MAX
        )));
    }

    let (sw, sh) = source;
    if sw == 0 || sh == 0 {
        return Err(PipelineError::Input(format!(
            "source image has degenerate dimensions {sw}x{sh}"
        )));
    }

    if keep_native {
        return Ok(TargetGeometry {
            width: sw,
            height: sh,
            scale: 1.0,
        });
    }

    let (mut width, mut height) = sheet_pixels(paper, dpi);
    if orientation == Orientation::Landscape {
        std::mem::swap(&mut width, &mut height);
    }

    let source_longer = f64::from(sw.max(sh));
    let target_longer = f64::from(width.max(height));
    let scale = (target_longer / source_longer).max(1.0);

    Ok(TargetGeometry {
        width,
        height,
        scale,
    })
}
