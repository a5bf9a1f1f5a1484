//! Final deterministic resample and save.
//!
//! The AI passes only scale by fixed integer factors, so they overshoot or
//! undershoot the requested print size; this step reconciles the last valid
//! artifact with the exact target dimensions, normalizes the color mode, and
//! embeds the requested DPI. The file appears at the requested path only via
//! an atomic rename after a fully successful write.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::geometry::TargetGeometry;

const MM_PER_INCH: f64 = 25.4;

/// PNG pHYs stores pixels per meter.
pub fn dpi_to_pixels_per_meter(dpi: u32) -> u32 {
    (f64::from(dpi) * 1000.0 / MM_PER_INCH).round() as u32
}

/// `{stem}__{W}x{H}px_{dpi}dpi.png` next to whatever the caller chose as
/// the output directory.
pub fn output_file_name(input: &Path, geometry: &TargetGeometry, dpi: u32) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "poster".to_string());
    format!(
        "{stem}__{}x{}px_{dpi}dpi.png",
        geometry.width, geometry.height
    )
}

/// Decodes the last valid artifact and resamples it to exactly the target
/// dimensions, flattening alpha, palettes, and high bit depths into plain
/// 8-bit RGB along the way.
pub fn resample_to_target(
    artifact: &Path,
    geometry: &TargetGeometry,
) -> Result<image::RgbImage, PipelineError> {
    let decoded = image::open(artifact).map_err(|err| {
        PipelineError::Input(format!(
            "failed to decode artifact {}: {err}",
            artifact.display()
        ))
    })?;

    let rgb = decoded.to_rgb8();
    if (rgb.width(), rgb.height()) == (geometry.width, geometry.height) {
        return Ok(rgb);
    }

    debug!(
        from_w = rgb.width(),
        from_h = rgb.height(),
        to_w = geometry.width,
        to_h = geometry.height,
        "resampling to exact target"
    );
    Ok(image::imageops::resize(
        &rgb,
        geometry.width,
        geometry.height,
        FilterType::Lanczos3,
    ))
}

/// Writes the PNG with embedded DPI to a hidden sibling, then atomically
/// renames it into place. No partial file survives a failure.
pub fn save_with_dpi(
    rgb: &image::RgbImage,
    dpi: u32,
    final_path: &Path,
) -> Result<(), PipelineError> {
    let partial = partial_path(final_path)?;
    write_png_with_dpi(rgb, dpi, &partial).inspect_err(|_| {
        let _ = fs::remove_file(&partial);
    })?;

    fs::rename(&partial, final_path).map_err(|err| {
        let _ = fs::remove_file(&partial);
        PipelineError::Write(format!(
            "failed to move output into place at {}: {err}",
            final_path.display()
        ))
    })?;

    info!(
        output = %final_path.display(),
        width = rgb.width(),
        height = rgb.height(),
        dpi,
        "final output written"
    );
    Ok(())
}

/// Resamples `artifact` to exactly the target dimensions and writes the
/// final PNG at `final_path`.
pub fn compose_final(
    artifact: &Path,
    geometry: &TargetGeometry,
    dpi: u32,
    final_path: &Path,
) -> Result<(), PipelineError> {
    let resized = resample_to_target(artifact, geometry)?;
    save_with_dpi(&resized, dpi, final_path)
}

/// Hidden sibling of the final path, same filesystem so the rename is
/// atomic.
fn partial_path(final_path: &Path) -> Result<PathBuf, PipelineError> {
    let name = final_path
        .file_name()
        .ok_or_else(|| {
            PipelineError::Write(format!(
                "output path {} has no file name",
                final_path.display()
            ))
        })?
        .to_string_lossy();
    Ok(final_path.with_file_name(format!(".{name}.partial")))
}

fn write_png_with_dpi(
    rgb: &image::RgbImage,
    dpi: u32,
    path: &Path,
) -> Result<(), PipelineError> {
    let file = fs::File::create(path).map_err(|err| {
        PipelineError::Write(format!("failed to create {}: {err}", path.display()))
    })?;
    let writer = BufWriter::new(file);

    let mut encoder = png::Encoder::new(writer, rgb.width(), rgb.height());
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let ppm = dpi_to_pixels_per_meter(dpi);
    encoder.set_pixel_dims(Some(png::PixelDimensions {
        xppu: ppm,
        yppu: ppm,
        unit: png::Unit::Meter,
    }));

    let mut writer = encoder.write_header().map_err(|err| {
        PipelineError::Write(format!("failed to write PNG header: {err}"))
    })?;
    writer.write_image_data(rgb.as_raw()).map_err(|err| {
        PipelineError::Write(format!("failed to write PNG data: {err}"))
    })?;
    writer
        .finish()
        .map_err(|err| PipelineError::Write(format!("failed to finish PNG: {err}")))?;
    Ok(())
}
