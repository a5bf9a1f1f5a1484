//! Bounded retry around a single upscale pass.
//!
//! Each pass gets at most three attempts. Between attempts the parameters
//! only ever move toward safer values: full precision first, then smaller
//! tiles down to the floor. Exhaustion is fatal for the whole run — there is
//! no silent fallback to plain resampling.

use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::invoker::{AttemptParams, InvokeJob, Upscaler, TILE_MIN};
use crate::plan::PassSpec;
use crate::progress::ProgressReporter;
use crate::request::Precision;
use crate::validate::validate_artifact;

pub const MAX_ATTEMPTS: u32 = 3;

/// States of the per-pass retry machine. `Succeeded` and `Failed` are
/// terminal; `Failed` aborts the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting,
    Validating,
    Succeeded,
    Degrading,
    Failed,
}

impl AttemptParams {
    /// The next safer parameter set, or `None` when both knobs are already
    /// at their safest values. Priority order is fixed: precision degrades
    /// before tile size, and neither ever moves back.
    pub fn degraded(&self) -> Option<AttemptParams> {
        if self.precision.is_high_throughput() {
            return Some(AttemptParams {
                precision: Precision::Fp32,
                ..*self
            });
        }
        if self.tile_size > TILE_MIN {
            return Some(AttemptParams {
                tile_size: (self.tile_size / 2).max(TILE_MIN),
                ..*self
            });
        }
        None
    }
}

/// Outcome of a pass that eventually produced a valid artifact.
#[derive(Debug)]
pub struct PassOutcome {
    pub artifact: PathBuf,
    pub attempts: u32,
}

/// Runs one planned pass to completion or run-fatal failure.
///
/// `input` is the previous artifact (or the original source for the first
/// pass); attempt outputs land in `work_dir`. Failed-attempt artifacts are
/// deleted before the next attempt begins.
#[allow(clippy::too_many_arguments)]
pub fn run_pass(
    pass_index: usize,
    spec: &PassSpec,
    input: &Path,
    work_dir: &Path,
    model: &str,
    models_dir: &Path,
    initial: AttemptParams,
    upscaler: &dyn Upscaler,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<PassOutcome, PipelineError> {
    let stage = format!("upscale {}", spec.factor);
    let window = spec.window;
    let mut params = initial;
    let mut last_error: Option<PipelineError> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        debug!(pass = pass_index + 1, attempt, state = ?RetryState::Attempting);
        let output = work_dir.join(format!("pass{}_attempt{}.png", pass_index + 1, attempt));
        let job = InvokeJob {
            pass_index,
            input: input.to_path_buf(),
            output: output.clone(),
            model: model.to_string(),
            models_dir: models_dir.to_path_buf(),
            factor: spec.factor.factor(),
            params,
        };

        reporter.log(format!(
            "pass {} attempt {}/{}: tile {}, {}",
            pass_index + 1,
            attempt,
            MAX_ATTEMPTS,
            params.tile_size,
            params.precision
        ));

        let invoked = {
            let mut on_progress =
                |fraction: f32| reporter.progress(window.at(fraction), &stage);
            upscaler.invoke(&job, &mut on_progress)
        };

        let failure = match invoked {
            Ok(()) => {
                debug!(pass = pass_index + 1, attempt, state = ?RetryState::Validating);
                let verdict = validate_artifact(&output);
                if verdict.is_valid() {
                    info!(
                        pass = pass_index + 1,
                        attempt,
                        artifact = %output.display(),
                        state = ?RetryState::Succeeded,
                        "pass complete"
                    );
                    reporter.progress(window.hi, &stage);
                    reporter.preview(&output);
                    return Ok(PassOutcome {
                        artifact: output,
                        attempts: attempt,
                    });
                }
                PipelineError::ValidationFailure {
                    pass: pass_index,
                    attempts: attempt,
                    detail: verdict.describe(),
                }
            }
            Err(err) if err.is_retryable() => err,
            // Cancellation and configuration problems abort immediately.
            Err(err) => return Err(err),
        };

        warn!(pass = pass_index + 1, attempt, error = %failure, "attempt failed");
        reporter.log(format!("attempt {attempt} failed: {failure}"));
        let _ = fs::remove_file(&output);
        last_error = Some(failure);

        if attempt == MAX_ATTEMPTS {
            break;
        }
        match params.degraded() {
            Some(next) => {
                info!(
                    pass = pass_index + 1,
                    tile = next.tile_size,
                    precision = %next.precision,
                    state = ?RetryState::Degrading,
                    "narrowing parameters for retry"
                );
                params = next;
            }
            None => {
                // Both knobs already at their safest; exhaust immediately.
                debug!(pass = pass_index + 1, state = ?RetryState::Failed);
                break;
            }
        }
    }

    debug!(pass = pass_index + 1, state = ?RetryState::Failed);
    Err(last_error.unwrap_or_else(|| PipelineError::ValidationFailure {
        pass: pass_index,
        attempts: 0,
        detail: "no attempts were executed".to_string(),
    }))
}
