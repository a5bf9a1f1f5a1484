//! End-to-end orchestration of one upscale run.
//!
//! Fail-fast checks → geometry → pass plan → retried passes → final
//! resample + save. All intermediates live in a run-owned temp directory
//! that is removed on every exit path, success or failure; the requested
//! output path only ever receives a fully written file.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compositor;
use crate::dpi;
use crate::error::PipelineError;
use crate::geometry::{self, TargetGeometry};
use crate::invoker::{AttemptParams, Upscaler};
use crate::models;
use crate::plan::{plan_passes, PassPlan, SAVE_WINDOW, SETUP_WINDOW};
use crate::progress::{ProgressReporter, RunEvent};
use crate::request::UpscaleRequest;
use crate::retry;

/// What a successful run reports back besides the event stream.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub output: PathBuf,
    pub geometry: TargetGeometry,
    pub passes_run: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Run-scoped state. The temp directory is owned exclusively by this run;
/// dropping it removes every intermediate regardless of how the run ends.
struct PipelineState {
    run_id: Uuid,
    work_dir: TempDir,
}

impl PipelineState {
    fn new() -> Result<Self, PipelineError> {
        let work_dir = tempfile::Builder::new()
            .prefix("posterforge-")
            .tempdir()
            .map_err(|err| {
                PipelineError::Write(format!("failed to create working directory: {err}"))
            })?;
        Ok(Self {
            run_id: Uuid::new_v4(),
            work_dir,
        })
    }
}

/// Executes one run synchronously. Blocking by design: the worker module
/// puts this on a dedicated blocking task so the caller's context stays
/// responsive.
pub fn run(
    request: &UpscaleRequest,
    upscaler: &dyn Upscaler,
    events: UnboundedSender<RunEvent>,
    cancel: &CancellationToken,
) -> Result<RunSummary, PipelineError> {
    let started_at = Utc::now();
    let mut reporter = ProgressReporter::new(events);
    reporter.progress(SETUP_WINDOW.lo, "setup");

    // Fail fast, before any geometry work or process spawn.
    dpi::validate_dpi(request.dpi, request.force_max_dpi)?;
    if !request.input.is_file() {
        return Err(PipelineError::Input(format!(
            "source image not found: {}",
            request.input.display()
        )));
    }

    let source_dims = image::image_dimensions(&request.input).map_err(|err| {
        PipelineError::Input(format!(
            "failed to read source image {}: {err}",
            request.input.display()
        ))
    })?;

    let geometry = geometry::resolve(
        request.paper,
        request.dpi,
        request.orientation,
        source_dims,
        request.keep_native,
    )?;
    let plan = plan_passes(geometry.scale);

    // The external tool is only a hard requirement when passes will run,
    // but whenever it is required the check happens before any spawn.
    if !plan.is_empty() {
        models::ensure_upscaler_available(&request.exe, &request.models_dir, &request.model)?;
    }

    fs::create_dir_all(&request.output_dir).map_err(|err| {
        PipelineError::Write(format!(
            "failed to create output directory {}: {err}",
            request.output_dir.display()
        ))
    })?;
    let final_path = request
        .output_dir
        .join(compositor::output_file_name(&request.input, &geometry, request.dpi));

    let state = PipelineState::new()?;
    info!(
        run_id = %state.run_id,
        input = %request.input.display(),
        source_w = source_dims.0,
        source_h = source_dims.1,
        target_w = geometry.width,
        target_h = geometry.height,
        scale = geometry.scale,
        passes = plan.passes.len(),
        "run started"
    );
    reporter.log(format!(
        "target {}x{} px at {} dpi, scale {:.2}, {} AI pass(es) planned",
        geometry.width,
        geometry.height,
        request.dpi,
        geometry.scale,
        plan.passes.len()
    ));
    reporter.progress(SETUP_WINDOW.hi, "setup");

    let result = execute_passes_and_compose(
        request,
        &geometry,
        &plan,
        &state,
        upscaler,
        &mut reporter,
        cancel,
        &final_path,
    );

    // RAII already guarantees cleanup; closing explicitly surfaces errors.
    let run_id = state.run_id;
    let work_path = state.work_dir.path().to_path_buf();
    if let Err(err) = state.work_dir.close() {
        warn!(path = %work_path.display(), error = %err, "failed to remove working directory");
    }

    let passes_run = plan.passes.len();
    result.map(|()| {
        let summary = RunSummary {
            run_id,
            output: final_path,
            geometry,
            passes_run,
            started_at,
            completed_at: Utc::now(),
        };
        info!(
            run_id = %summary.run_id,
            output = %summary.output.display(),
            "run complete"
        );
        summary
    })
}

#[allow(clippy::too_many_arguments)]
fn execute_passes_and_compose(
    request: &UpscaleRequest,
    geometry: &TargetGeometry,
    plan: &PassPlan,
    state: &PipelineState,
    upscaler: &dyn Upscaler,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
    final_path: &std::path::Path,
) -> Result<(), PipelineError> {
    let mut current = request.input.clone();

    for (index, spec) in plan.passes.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Every pass starts from the user's (clamped) preferences; only
        // retries within the pass degrade them.
        let initial = AttemptParams::initial(request.tile_size, request.precision);
        let outcome = retry::run_pass(
            index,
            spec,
            &current,
            state.work_dir.path(),
            &request.model,
            &request.models_dir,
            initial,
            upscaler,
            reporter,
            cancel,
        )?;
        reporter.log(format!(
            "pass {} produced {} after {} attempt(s)",
            index + 1,
            outcome.artifact.display(),
            outcome.attempts
        ));
        current = outcome.artifact;
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let resample_window = plan.resample_window();
    reporter.progress(resample_window.lo, "resample");
    let resized = compositor::resample_to_target(&current, geometry)?;

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    reporter.progress(SAVE_WINDOW.lo, "save");
    compositor::save_with_dpi(&resized, request.dpi, final_path)?;

    reporter.preview(final_path);
    reporter.progress(SAVE_WINDOW.hi, "done");
    Ok(())
}
