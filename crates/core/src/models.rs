//! Discovery and validation of NCNN upscale models.
//!
//! A model is a `<name>.param` / `<name>.bin` pair inside the models
//! directory. The pipeline validates the requested model eagerly, before any
//! process is spawned; the registry also backs the CLI's model listing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::error::PipelineError;

pub const DEFAULT_MODEL: &str = "realesrgan-x4plus";

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub param_file: PathBuf,
    pub bin_file: PathBuf,
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    /// Scans the models directory for complete `.param`/`.bin` pairs.
    /// Orphaned halves are skipped (the tool cannot load them anyway).
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();

            let is_param = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("param"))
                .unwrap_or(false);
            if !is_param {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let bin = path.with_extension("bin");
            if !bin.is_file() {
                debug!(model = %name, "skipping model without .bin half");
                continue;
            }

            if self.entries.iter().any(|e| e.name == name) {
                continue;
            }

            self.entries.push(ModelEntry {
                name: name.to_string(),
                param_file: path.clone(),
                bin_file: bin,
            });
        }

        self.entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Eager pre-flight check: the executable, the models directory, and both
/// halves of the chosen model must exist before anything is spawned.
pub fn ensure_upscaler_available(
    exe: &Path,
    models_dir: &Path,
    model: &str,
) -> Result<(), PipelineError> {
    if !exe.is_file() {
        return Err(PipelineError::Config(format!(
            "upscaler executable not found: {}",
            exe.display()
        )));
    }
    if !models_dir.is_dir() {
        return Err(PipelineError::Config(format!(
            "models directory not found: {}",
            models_dir.display()
        )));
    }

    let param = models_dir.join(format!("{model}.param"));
    let bin = models_dir.join(format!("{model}.bin"));
    for required in [&param, &bin] {
        if !required.is_file() {
            return Err(PipelineError::Config(format!(
                "model '{model}' is missing required file {}",
                required.display()
            )));
        }
    }
    Ok(())
}
