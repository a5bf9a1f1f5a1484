use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use posterforge_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use posterforge_core::dpi::{self, QualityPreset};
use posterforge_core::logging::{
    compose_logging_init_plan, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER,
};
use posterforge_core::models::ModelRegistry;
use posterforge_core::progress::RunEvent;
use posterforge_core::request::{Orientation, PaperSize, Precision, UpscaleRequest};
use posterforge_core::worker;

#[derive(Parser)]
#[command(
    name = "posterforge",
    about = "Print-exact AI image upscaling via an external upscaler"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory for config and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale one or more images to an exact print size.
    Run(RunArgs),
    /// List the upscale models available in the models directory.
    Models(ModelsArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(required = true, help = "Input image(s); multiple files run sequentially")]
    inputs: Vec<PathBuf>,

    #[arg(short = 'o', long, help = "Output directory (defaults to config)")]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value = "a1", help = "Paper size (a0..a4)")]
    paper: PaperSize,

    #[arg(long, help = "Print resolution in DPI (150-600)")]
    dpi: Option<u32>,

    #[arg(
        long,
        conflicts_with = "dpi",
        help = "Quality preset (low, medium, high, highest) instead of an explicit DPI"
    )]
    quality: Option<QualityPreset>,

    #[arg(long, default_value = "portrait", help = "portrait or landscape")]
    orientation: Orientation,

    #[arg(long, help = "Path to the upscaler executable (overrides config)")]
    exe: Option<PathBuf>,

    #[arg(long, help = "Models directory (overrides config)")]
    models_dir: Option<PathBuf>,

    #[arg(long, help = "Model name (overrides config)")]
    model: Option<String>,

    #[arg(long, help = "Tile size; values outside 64-512 are clamped")]
    tile: Option<i64>,

    #[arg(long, help = "Start at full precision instead of fp16")]
    fp32: bool,

    #[arg(long, help = "Skip AI passes and keep the source pixel size")]
    keep_native: bool,

    #[arg(long, help = "Acknowledge the cost of 600 DPI output")]
    force_max_dpi: bool,

    #[arg(long, help = "Per-pass timeout in seconds (overrides config)")]
    timeout_secs: Option<u64>,

    #[arg(long, help = "Emit run events as JSON lines on stdout")]
    json: bool,
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, help = "Models directory (overrides config)")]
    models_dir: Option<PathBuf>,
}

/// The per-run knobs after merging CLI flags over the loaded config.
struct RunSettings {
    exe: PathBuf,
    models_dir: PathBuf,
    model: String,
    tile_size: i64,
    precision: Precision,
    timeout: Duration,
    output_dir: PathBuf,
}

fn resolve_run_settings(args: &RunArgs, config: &AppConfig, data_dir: &Path) -> RunSettings {
    let upscaler = &config.upscaler;
    RunSettings {
        exe: args.exe.clone().unwrap_or_else(|| upscaler.exe.clone()),
        models_dir: args
            .models_dir
            .clone()
            .unwrap_or_else(|| resolve_relative_to(data_dir, &upscaler.models_dir)),
        model: args
            .model
            .clone()
            .unwrap_or_else(|| upscaler.default_model.clone()),
        tile_size: args.tile.unwrap_or(upscaler.tile_size),
        precision: if args.fp32 {
            Precision::Fp32
        } else {
            upscaler.precision
        },
        timeout: Duration::from_secs(args.timeout_secs.unwrap_or(upscaler.timeout_secs)),
        output_dir: args
            .output_dir
            .clone()
            .unwrap_or_else(|| config.output.dir.clone()),
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        "posterforge starting"
    );

    match cli.command {
        Commands::Run(args) => run_batch(args, resolved_data_dir).await,
        Commands::Models(args) => list_models(args, resolved_data_dir),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Explicit `--dpi` wins; a `--quality` preset supplies one otherwise.
fn resolve_dpi(args: &RunArgs) -> u32 {
    args.dpi
        .or_else(|| args.quality.map(QualityPreset::default_dpi))
        .unwrap_or_else(|| QualityPreset::High.default_dpi())
}

async fn run_batch(args: RunArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let settings = resolve_run_settings(&args, &config, &data_dir);

    let dpi = resolve_dpi(&args);
    match dpi::choice_label(dpi) {
        Some(label) => info!(dpi, "{label}"),
        None => warn!(
            dpi,
            "non-standard DPI; common choices are 150, 200, 240, 300, 360, 600"
        ),
    }

    let total = args.inputs.len();
    let mut failed = 0usize;

    for (index, input) in args.inputs.iter().enumerate() {
        info!(
            input = %input.display(),
            "processing file {} of {total}",
            index + 1
        );

        let request = UpscaleRequest {
            input: input.clone(),
            output_dir: settings.output_dir.clone(),
            paper: args.paper,
            dpi,
            orientation: args.orientation,
            exe: settings.exe.clone(),
            models_dir: settings.models_dir.clone(),
            model: settings.model.clone(),
            tile_size: settings.tile_size,
            precision: settings.precision,
            keep_native: args.keep_native,
            force_max_dpi: args.force_max_dpi,
        };

        let mut handle = worker::spawn_run(request, settings.timeout);

        // Ctrl-C cancels the active run; the external process is killed
        // promptly and temp artifacts are cleaned up.
        let cancel = handle.cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested");
                cancel.cancel();
            }
        });

        while let Some(event) = handle.events.recv().await {
            if matches!(event, RunEvent::Failed { .. }) {
                failed += 1;
            }
            render_event(&event, args.json)?;
        }
        ctrl_c.abort();
        let _ = handle.join.await;
    }

    if failed > 0 {
        bail!("{failed} of {total} run(s) failed");
    }
    Ok(())
}

fn render_event(event: &RunEvent, json: bool) -> Result<()> {
    if json {
        let line = serde_json::to_string(event).context("failed to encode event as JSON")?;
        println!("{line}");
        return Ok(());
    }

    match event {
        RunEvent::Progress { percent, stage } => println!("[{percent:>3}%] {stage}"),
        RunEvent::Log { line } => println!("       {line}"),
        RunEvent::Preview { path } => println!("       preview: {}", path.display()),
        RunEvent::Finished { output_path } => println!("done: {}", output_path.display()),
        RunEvent::Failed { kind, message } => eprintln!("failed ({kind}): {message}"),
    }
    Ok(())
}

fn list_models(args: ModelsArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let models_dir = args
        .models_dir
        .unwrap_or_else(|| resolve_relative_to(&data_dir, &config.upscaler.models_dir));

    let mut registry = ModelRegistry::new(models_dir.clone());
    registry
        .discover()
        .with_context(|| format!("failed to scan models in {}", models_dir.display()))?;

    if registry.list().is_empty() {
        println!("no models found in {}", models_dir.display());
        return Ok(());
    }
    for entry in registry.list() {
        println!("{}", entry.name);
    }
    Ok(())
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
    };
    let plan = compose_logging_init_plan(&options);
    let console_env_filter = parse_env_filter_with_fallback(&plan.console_filter, "console");

    match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_env_filter = parse_env_filter_with_fallback(&plan.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
