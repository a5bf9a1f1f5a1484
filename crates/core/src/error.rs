use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable classification of a run failure, carried on the
/// terminal [`RunEvent::Failed`](crate::progress::RunEvent) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidGeometry,
    InputError,
    ConfigError,
    Timeout,
    UpscalerFailed,
    ValidationFailure,
    WriteError,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidGeometry => "invalid_geometry",
            Self::InputError => "input_error",
            Self::ConfigError => "config_error",
            Self::Timeout => "timeout",
            Self::UpscalerFailed => "upscaler_failed",
            Self::ValidationFailure => "validation_failure",
            Self::WriteError => "write_error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("input error: {0}")]
    Input(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("upscaler timed out after {seconds}s on pass {pass}")]
    Timeout { pass: usize, seconds: u64 },

    #[error("upscaler exited with {status} on pass {pass}: {stderr_tail}")]
    UpscalerFailed {
        pass: usize,
        status: String,
        stderr_tail: String,
    },

    #[error("pass {pass} failed validation after {attempts} attempts: {detail}")]
    ValidationFailure {
        pass: usize,
        attempts: u32,
        detail: String,
    },

    #[error("failed to write output: {0}")]
    Write(String),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidGeometry(_) => ErrorKind::InvalidGeometry,
            Self::Input(_) => ErrorKind::InputError,
            Self::Config(_) => ErrorKind::ConfigError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UpscalerFailed { .. } => ErrorKind::UpscalerFailed,
            Self::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            Self::Write(_) => ErrorKind::WriteError,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Attempt-level failures feed the retry ladder; everything else aborts
    /// the run as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::UpscalerFailed { .. } | Self::ValidationFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_every_variant() {
        assert_eq!(
            PipelineError::InvalidGeometry("dpi".into()).kind(),
            ErrorKind::InvalidGeometry
        );
        assert_eq!(
            PipelineError::Input("missing".into()).kind(),
            ErrorKind::InputError
        );
        assert_eq!(
            PipelineError::Config("no exe".into()).kind(),
            ErrorKind::ConfigError
        );
        assert_eq!(
            PipelineError::Timeout {
                pass: 0,
                seconds: 1800
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(PipelineError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn cancellation_is_never_retryable() {
        assert!(!PipelineError::Cancelled.is_retryable());
        assert!(PipelineError::Timeout {
            pass: 1,
            seconds: 5
        }
        .is_retryable());
        assert!(PipelineError::ValidationFailure {
            pass: 0,
            attempts: 1,
            detail: "black frame".into()
        }
        .is_retryable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let encoded = serde_json::to_string(&ErrorKind::ValidationFailure).expect("serialize kind");
        assert_eq!(encoded, "\"validation_failure\"");
    }
}
