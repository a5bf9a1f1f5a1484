//! Logging bootstrap: filter selection and the rolling file sink plan.
//!
//! The core only *plans* logging; the app crate builds the actual
//! `tracing-subscriber` layers from the plan so the choice of console
//! formatting stays with the binary.

use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Child-process stderr is mirrored at debug level under this target; keep
/// it out of the default view.
pub const DEFAULT_NOISE_FILTER: &str = "upscaler_stderr=error,pipeline_log=error";
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "posterforge";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub console_filter: String,
    pub file_filter: String,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// File logging unavailable; console-only with the reason surfaced.
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Filter precedence: explicit CLI filter > RUST_LOG > -v verbosity >
/// default. The noise filter is appended only when the user did not write
/// an explicit filter of their own.
pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options
        .cli_log_filter
        .as_deref()
        .filter(|f| !f.trim().is_empty())
    {
        return filter.to_string();
    }
    if let Some(filter) = options
        .rust_log_env
        .as_deref()
        .filter(|f| !f.trim().is_empty())
    {
        return filter.to_string();
    }

    let base = match options.verbose {
        0 => DEFAULT_LOG_FILTER,
        1 => "debug",
        _ => "trace",
    };
    if options.verbose > 0 {
        base.to_string()
    } else {
        format!("{base},{DEFAULT_NOISE_FILTER}")
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    let user_filter = select_log_filter(options);
    // The file sink always keeps the child-process chatter available for
    // post-mortems, so it gets at least debug for the pipeline targets.
    let file_filter = if options.cli_log_filter.is_some() || options.rust_log_env.is_some() {
        user_filter.clone()
    } else {
        format!("{user_filter},upscaler_stderr=debug,pipeline_log=debug")
    };

    let file_sink = match &options.data_dir {
        None => FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "no data directory configured".to_string(),
        },
        Some(data_dir) => {
            let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
            match fs::create_dir_all(&log_dir) {
                Ok(()) => FileSinkPlan::Ready {
                    appender: RollingFileAppender::new(
                        Rotation::DAILY,
                        &log_dir,
                        format!("{DEFAULT_LOG_FILE_PREFIX}.{DEFAULT_LOG_FILE_SUFFIX}"),
                    ),
                    log_dir,
                },
                Err(err) => FileSinkPlan::Fallback {
                    attempted_log_dir: Some(log_dir),
                    reason: err.to_string(),
                },
            }
        }
    };

    LoggingInitPlan {
        console_filter: user_filter,
        file_filter,
        file_sink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_filter_wins_over_everything() {
        let options = LoggingInitOptions {
            cli_log_filter: Some("warn".to_string()),
            rust_log_env: Some("debug".to_string()),
            verbose: 2,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&options), "warn");
    }

    #[test]
    fn rust_log_wins_over_verbosity() {
        let options = LoggingInitOptions {
            rust_log_env: Some("posterforge_core=debug".to_string()),
            verbose: 1,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&options), "posterforge_core=debug");
    }

    #[test]
    fn verbosity_escalates_without_noise_filter() {
        let quiet = LoggingInitOptions::default();
        assert_eq!(
            select_log_filter(&quiet),
            format!("info,{DEFAULT_NOISE_FILTER}")
        );

        let debug = LoggingInitOptions {
            verbose: 1,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&debug), "debug");

        let trace = LoggingInitOptions {
            verbose: 3,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&trace), "trace");
    }

    #[test]
    fn empty_cli_filter_falls_through() {
        let options = LoggingInitOptions {
            cli_log_filter: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            select_log_filter(&options),
            format!("info,{DEFAULT_NOISE_FILTER}")
        );
    }

    #[test]
    fn plan_without_data_dir_falls_back_to_console() {
        let plan = compose_logging_init_plan(&LoggingInitOptions::default());
        assert!(!plan.file_sink.is_ready());
    }

    #[test]
    fn plan_with_writable_data_dir_is_ready() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = compose_logging_init_plan(&LoggingInitOptions {
            data_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        });
        assert!(plan.file_sink.is_ready());
        assert!(temp.path().join(DEFAULT_LOG_DIR_NAME).is_dir());
    }

    #[test]
    fn file_filter_keeps_child_stderr_visible() {
        let plan = compose_logging_init_plan(&LoggingInitOptions::default());
        assert!(plan.file_filter.contains("upscaler_stderr=debug"));
        assert!(plan.console_filter.contains("upscaler_stderr=error"));
    }
}
