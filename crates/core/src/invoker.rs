//! One upscale pass via the external NCNN binary.
//!
//! The process boundary is exit code + output file only — no structured IPC.
//! The binary is launched with a safety-capped parameter set, its stderr is
//! drained on a background thread (progress percentages are parsed out of
//! it), and the whole invocation is bounded by a wall-clock timeout and the
//! run's cancellation token.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::request::Precision;

pub const TILE_MIN: u32 = 64;
pub const TILE_MAX: u32 = 512;

/// Default wall-clock bound per invocation; sized for an A0 sheet at the
/// highest DPI tier on modest hardware.
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(1800);

/// Environment variable constraining which compute devices the child may
/// see. Scoped to the child process, never set on the parent.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// How many trailing stderr lines are kept for error reporting.
const STDERR_TAIL_LINES: usize = 16;

/// Poll interval for child exit / timeout / cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Clamp a user tile-size preference into the safe range. Out-of-range
/// values (including nonsense like 0 or negatives) are clamped, not
/// rejected.
pub fn clamp_tile(requested: i64) -> u32 {
    requested.clamp(i64::from(TILE_MIN), i64::from(TILE_MAX)) as u32
}

/// Active parameters of a single attempt. The retry ladder only ever moves
/// these toward safer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptParams {
    pub tile_size: u32,
    pub precision: Precision,
    /// Pinned to device 0; kept explicit so logs and tests can assert it.
    pub device: u32,
}

impl AttemptParams {
    pub fn initial(requested_tile: i64, precision: Precision) -> Self {
        Self {
            tile_size: clamp_tile(requested_tile),
            precision,
            device: 0,
        }
    }
}

/// Everything one invocation needs besides the executable itself.
#[derive(Debug, Clone)]
pub struct InvokeJob {
    pub pass_index: usize,
    pub input: PathBuf,
    pub output: PathBuf,
    pub model: String,
    pub models_dir: PathBuf,
    pub factor: u32,
    pub params: AttemptParams,
}

/// Seam for the retry coordinator: production uses [`NcnnUpscaler`], tests
/// substitute deterministic fakes that never spawn a process.
pub trait Upscaler: Send + Sync {
    /// Runs one pass. `on_progress` receives within-pass fractions in
    /// 0.0..=1.0 as the tool reports them.
    fn invoke(
        &self,
        job: &InvokeJob,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<(), PipelineError>;
}

pub struct NcnnUpscaler {
    exe: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
}

/// Kills the child on drop so an early return can never leak a running
/// upscaler process.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

enum StderrMessage {
    Percent(f32),
    Line(String),
}

impl NcnnUpscaler {
    pub fn new(exe: PathBuf, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            exe,
            timeout,
            cancel,
        }
    }

    fn build_args(&self, job: &InvokeJob) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-i".into(),
            job.input.to_string_lossy().into_owned(),
            "-o".into(),
            job.output.to_string_lossy().into_owned(),
            "-n".into(),
            job.model.clone(),
            "-s".into(),
            job.factor.to_string(),
            "-t".into(),
            job.params.tile_size.to_string(),
            "-m".into(),
            job.models_dir.to_string_lossy().into_owned(),
            "-f".into(),
            "png".into(),
            "-g".into(),
            job.params.device.to_string(),
        ];
        if job.params.precision.is_high_throughput() {
            args.push("-x".into());
        }
        args
    }
}

impl Upscaler for NcnnUpscaler {
    fn invoke(
        &self,
        job: &InvokeJob,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<(), PipelineError> {
        let args = self.build_args(job);
        debug!(
            exe = %self.exe.display(),
            args = %args.join(" "),
            "launching upscaler"
        );

        let mut command = std::process::Command::new(&self.exe);
        command
            .args(&args)
            .env(VISIBLE_DEVICES_ENV, job.params.device.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(parent) = self.exe.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(parent);
        }

        let mut child = command.spawn().map_err(|err| {
            PipelineError::Config(format!(
                "failed to launch upscaler {}: {err}",
                self.exe.display()
            ))
        })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            PipelineError::Config("failed to capture upscaler stderr".to_string())
        })?;
        let mut child = ChildGuard(child);

        let (tx, rx) = mpsc::channel();
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let message = match parse_percent_line(&line) {
                    Some(fraction) => StderrMessage::Percent(fraction),
                    None => StderrMessage::Line(line),
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        let deadline = Instant::now() + self.timeout;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        let status = loop {
            drain_stderr(&rx, &mut tail, on_progress);

            match child.0.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    return Err(PipelineError::UpscalerFailed {
                        pass: job.pass_index,
                        status: format!("wait failed: {err}"),
                        stderr_tail: collect_tail(&tail),
                    });
                }
            }

            if self.cancel.is_cancelled() {
                debug!(pass = job.pass_index, "cancellation requested, killing upscaler");
                drop(child);
                let _ = stderr_thread.join();
                return Err(PipelineError::Cancelled);
            }

            if Instant::now() >= deadline {
                warn!(
                    pass = job.pass_index,
                    timeout_secs = self.timeout.as_secs(),
                    "upscaler exceeded timeout, killing"
                );
                drop(child);
                let _ = stderr_thread.join();
                return Err(PipelineError::Timeout {
                    pass: job.pass_index,
                    seconds: self.timeout.as_secs(),
                });
            }

            thread::sleep(POLL_INTERVAL);
        };

        let _ = stderr_thread.join();
        drain_stderr(&rx, &mut tail, on_progress);

        if !status.success() {
            return Err(PipelineError::UpscalerFailed {
                pass: job.pass_index,
                status: status.to_string(),
                stderr_tail: collect_tail(&tail),
            });
        }

        Ok(())
    }
}

fn drain_stderr(
    rx: &mpsc::Receiver<StderrMessage>,
    tail: &mut VecDeque<String>,
    on_progress: &mut dyn FnMut(f32),
) {
    while let Ok(message) = rx.try_recv() {
        match message {
            StderrMessage::Percent(fraction) => on_progress(fraction),
            StderrMessage::Line(line) => {
                debug!(target: "upscaler_stderr", "{line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    }
}

fn collect_tail(tail: &VecDeque<String>) -> String {
    if tail.is_empty() {
        return "<no stderr output>".to_string();
    }
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// The tool reports tile progress as bare `NN.NN%` lines on stderr. Returns
/// the fraction in 0.0..=1.0, or `None` for anything else.
fn parse_percent_line(line: &str) -> Option<f32> {
    let number = line.strip_suffix('%')?.trim();
    let value: f32 = number.replace(',', ".").parse().ok()?;
    if !(0.0..=100.0).contains(&value) {
        return None;
    }
    Some(value / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn tile_clamp_covers_pathological_inputs() {
        assert_eq!(clamp_tile(0), TILE_MIN);
        assert_eq!(clamp_tile(-32), TILE_MIN);
        assert_eq!(clamp_tile(63), TILE_MIN);
        assert_eq!(clamp_tile(64), 64);
        assert_eq!(clamp_tile(300), 300);
        assert_eq!(clamp_tile(512), 512);
        assert_eq!(clamp_tile(513), TILE_MAX);
        assert_eq!(clamp_tile(10_001), TILE_MAX);
    }

    #[test]
    fn initial_params_pin_device_zero() {
        let params = AttemptParams::initial(20_000, Precision::Fp16);
        assert_eq!(params.device, 0);
        assert_eq!(params.tile_size, TILE_MAX);
    }

    #[test]
    fn percent_lines_parse_to_fractions() {
        assert_eq!(parse_percent_line("12.50%"), Some(0.125));
        assert_eq!(parse_percent_line("100%"), Some(1.0));
        assert_eq!(parse_percent_line("7,25%"), Some(0.0725));
        assert_eq!(parse_percent_line("0.00%"), Some(0.0));
        assert_eq!(parse_percent_line("140%"), None);
        assert_eq!(parse_percent_line("[INFO] loading model"), None);
        assert_eq!(parse_percent_line("done"), None);
    }

    fn sample_job(params: AttemptParams) -> InvokeJob {
        InvokeJob {
            pass_index: 0,
            input: PathBuf::from("/tmp/in.png"),
            output: PathBuf::from("/tmp/out.png"),
            model: "realesrgan-x4plus".to_string(),
            models_dir: PathBuf::from("/opt/models"),
            factor: 4,
            params,
        }
    }

    #[test]
    fn args_always_carry_models_dir_and_device() {
        let upscaler = NcnnUpscaler::new(
            PathBuf::from("/opt/realesrgan-ncnn-vulkan"),
            DEFAULT_PASS_TIMEOUT,
            CancellationToken::new(),
        );
        let args = upscaler.build_args(&sample_job(AttemptParams::initial(512, Precision::Fp16)));

        let m_pos = args.iter().position(|a| a == "-m").expect("-m present");
        assert_eq!(args[m_pos + 1], "/opt/models");
        let g_pos = args.iter().position(|a| a == "-g").expect("-g present");
        assert_eq!(args[g_pos + 1], "0");
        assert!(args.contains(&"-x".to_string()), "fp16 adds the -x flag");
    }

    #[test]
    fn full_precision_omits_the_fp16_flag() {
        let upscaler = NcnnUpscaler::new(
            PathBuf::from("/opt/realesrgan-ncnn-vulkan"),
            DEFAULT_PASS_TIMEOUT,
            CancellationToken::new(),
        );
        let args = upscaler.build_args(&sample_job(AttemptParams {
            tile_size: 128,
            precision: Precision::Fp32,
            device: 0,
        }));
        assert!(!args.contains(&"-x".to_string()));
        let t_pos = args.iter().position(|a| a == "-t").expect("-t present");
        assert_eq!(args[t_pos + 1], "128");
    }

    /// Writes an executable shell script standing in for the upscaler.
    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-upscaler.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake tool");
        let mut perms = std::fs::metadata(&path).expect("stat fake tool").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod fake tool");
        path
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_a_hung_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = fake_tool(dir.path(), "sleep 30");
        let upscaler = NcnnUpscaler::new(exe, Duration::from_millis(200), CancellationToken::new());

        let started = Instant::now();
        let err = upscaler
            .invoke(
                &sample_job(AttemptParams::initial(512, Precision::Fp16)),
                &mut |_| {},
            )
            .expect_err("hung child must time out");
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_interrupts_a_running_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = fake_tool(dir.path(), "sleep 30");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let upscaler = NcnnUpscaler::new(exe, Duration::from_secs(30), cancel);

        let err = upscaler
            .invoke(
                &sample_job(AttemptParams::initial(512, Precision::Fp16)),
                &mut |_| {},
            )
            .expect_err("pre-cancelled token must abort the invocation");
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
    }

    #[cfg(unix)]
    #[test]
    fn stderr_percentages_reach_the_progress_callback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = fake_tool(
            dir.path(),
            "echo '25.00%' >&2\necho 'tile 1/4 done' >&2\necho '100.00%' >&2",
        );
        let upscaler =
            NcnnUpscaler::new(exe, Duration::from_secs(10), CancellationToken::new());

        let mut fractions = Vec::new();
        upscaler
            .invoke(
                &sample_job(AttemptParams::initial(512, Precision::Fp16)),
                &mut |f| fractions.push(f),
            )
            .expect("fake tool exits zero");
        assert_eq!(fractions, vec![0.25, 1.0]);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_carries_the_stderr_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = fake_tool(dir.path(), "echo 'vkAllocateMemory failed' >&2\nexit 3");
        let upscaler =
            NcnnUpscaler::new(exe, Duration::from_secs(10), CancellationToken::new());

        let err = upscaler
            .invoke(
                &sample_job(AttemptParams::initial(512, Precision::Fp16)),
                &mut |_| {},
            )
            .expect_err("exit 3 must fail the attempt");
        match err {
            PipelineError::UpscalerFailed { stderr_tail, .. } => {
                assert!(stderr_tail.contains("vkAllocateMemory failed"));
            }
            other => panic!("expected UpscalerFailed, got {other:?}"),
        }
    }

    #[test]
    fn missing_executable_is_a_config_error() {
        let upscaler = NcnnUpscaler::new(
            PathBuf::from("/nonexistent/upscaler-binary"),
            DEFAULT_PASS_TIMEOUT,
            CancellationToken::new(),
        );
        let job = sample_job(AttemptParams::initial(512, Precision::Fp16));
        let err = upscaler
            .invoke(&job, &mut |_| {})
            .expect_err("missing binary must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigError);
    }
}
