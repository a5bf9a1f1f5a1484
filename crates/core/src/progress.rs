//! The outbound event stream and the monotonic progress reporter.
//!
//! Events are delivered over an ordered, unbounded channel; the observer must
//! not assume synchronous delivery. A dropped receiver never fails the run.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress { percent: u8, stage: String },
    Log { line: String },
    /// Path of an intermediate artifact suitable for display to the user.
    Preview { path: PathBuf },
    Finished { output_path: PathBuf },
    Failed { kind: ErrorKind, message: String },
}

/// Maps pipeline-internal positions onto the public 0-100 scale.
///
/// Emitted percentages never regress: retries re-enter the same progress
/// window, so the reporter clamps to the high-water mark instead of trusting
/// callers to stay monotone.
pub struct ProgressReporter {
    tx: UnboundedSender<RunEvent>,
    high_water: u8,
}

impl ProgressReporter {
    pub fn new(tx: UnboundedSender<RunEvent>) -> Self {
        Self { tx, high_water: 0 }
    }

    pub fn progress(&mut self, percent: u8, stage: &str) {
        let clamped = percent.min(100).max(self.high_water);
        if clamped == self.high_water && percent < self.high_water {
            // A retry walked backwards inside its window; hold the line.
            debug!(percent, high_water = self.high_water, "progress clamped");
        }
        self.high_water = clamped;
        self.send(RunEvent::Progress {
            percent: clamped,
            stage: stage.to_string(),
        });
    }

    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(target: "pipeline_log", "{line}");
        self.send(RunEvent::Log { line });
    }

    pub fn preview(&self, path: &std::path::Path) {
        self.send(RunEvent::Preview {
            path: path.to_path_buf(),
        });
    }

    pub fn last_percent(&self) -> u8 {
        self.high_water
    }

    fn send(&self, event: RunEvent) {
        // The observer may have gone away; the run itself must not care.
        let _ = self.tx.send(event);
    }
}
