use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upsampler_core::config::{config_path, UpsamplerConfig};
use upsampler_core::estimators::backend::InferenceBackend;
use upsampler_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use upsampler_core::upsampler::Upsampler;

#[derive(Parser, Debug)]
#[command(
    name = "upsampler",
    about = "Motion-adaptive frame upsampling for image sequences"
)]
struct Cli {
    #[arg(long = "input-dir", help = "Root directory searched for image sequences")]
    input_dir: PathBuf,

    #[arg(long = "output-dir", help = "Destination root; must not exist yet")]
    output_dir: PathBuf,

    #[arg(long, value_name = "FILE", help = "TOML config (defaults to $UPSAMPLER_CONFIG)")]
    config: Option<PathBuf>,

    #[arg(long = "flow-model", value_name = "ONNX", help = "Flow-computation network")]
    flow_model: Option<PathBuf>,

    #[arg(
        long = "refinement-model",
        value_name = "ONNX",
        help = "Arbitrary-time flow interpolation network"
    )]
    refinement_model: Option<PathBuf>,

    #[arg(long, value_name = "BACKEND", help = "cpu, cuda or tensorrt")]
    backend: Option<String>,

    #[arg(long = "device-id", help = "GPU device index for accelerated backends")]
    device_id: Option<i32>,

    #[arg(long = "blend-epsilon", help = "Lower bound of the blend denominator")]
    blend_epsilon: Option<f32>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long = "log-dir", value_name = "DIR", help = "Directory for rolling log files")]
    log_dir: Option<PathBuf>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();

    upsampler_core::runtime::setup_ort_dylib();
    init_logging(cli.log_dir.as_deref(), cli.verbose, cli.log_filter.as_deref());
    upsampler_core::runtime::log_ort_dylib_status();

    let config = load_config(&cli)?;
    info!(
        input_dir = %cli.input_dir.display(),
        output_dir = %cli.output_dir.display(),
        backend = %config.inference.backend,
        flow_model = %config.models.flow.display(),
        refinement_model = %config.models.refinement.display(),
        "Starting upsampler"
    );

    let mut upsampler = Upsampler::from_config(&cli.input_dir, &cli.output_dir, &config)?;
    let summary = upsampler.run()?;
    info!(
        sequences = summary.sequences,
        frames = summary.frames,
        output_dir = %upsampler.output_dir().display(),
        "Done"
    );
    Ok(())
}

fn load_config(cli: &Cli) -> Result<UpsamplerConfig> {
    let mut config = match config_path(cli.config.as_deref()) {
        Some(path) => UpsamplerConfig::load_from_path(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => UpsamplerConfig::default(),
    };
    apply_cli_overrides(&mut config, cli);
    Ok(config)
}

fn apply_cli_overrides(config: &mut UpsamplerConfig, cli: &Cli) {
    if let Some(path) = &cli.flow_model {
        config.models.flow = path.clone();
    }
    if let Some(path) = &cli.refinement_model {
        config.models.refinement = path.clone();
    }
    if let Some(backend) = cli.backend.as_deref() {
        let parsed = InferenceBackend::from_str_lossy(backend);
        if parsed.to_string() != backend.trim().to_ascii_lowercase() {
            warn!(requested = backend, using = %parsed, "Unrecognized backend name");
        }
        config.inference.backend = parsed;
    }
    if let Some(device_id) = cli.device_id {
        config.inference.device_id = device_id;
    }
    if let Some(epsilon) = cli.blend_epsilon {
        config.interpolation.blend_epsilon = epsilon;
    }
}

fn init_logging(log_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        log_dir: log_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let user_filter = init_plan.filters.user_filter;
    let filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let log_dir = ready.log_dir;
            let retention_files = ready.retention_files;
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            info!(
                log_dir = %log_dir.display(),
                retention_files,
                filter = %user_filter,
                "Persistent file logging enabled"
            );
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            // No directory requested means console-only by choice.
            if let Some(attempted_log_dir) = fallback.attempted_log_dir {
                warn!(
                    attempted_log_dir = %attempted_log_dir.display(),
                    reason = %fallback.reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["upsampler", "--input-dir", "in", "--output-dir", "out"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).expect("parse cli")
    }

    #[test]
    fn input_and_output_dirs_are_required() {
        assert!(Cli::try_parse_from(["upsampler", "--input-dir", "in"]).is_err());
        assert!(Cli::try_parse_from(["upsampler", "--output-dir", "out"]).is_err());
    }

    #[test]
    fn verbose_flag_counts() {
        assert_eq!(parse(&[]).verbose, 0);
        assert_eq!(parse(&["-vv"]).verbose, 2);
    }

    #[test]
    fn cli_overrides_replace_config_values() {
        let cli = parse(&[
            "--flow-model",
            "/m/fc.onnx",
            "--backend",
            "TRT",
            "--device-id",
            "1",
            "--blend-epsilon",
            "0.01",
        ]);
        let mut config = UpsamplerConfig::default();
        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.models.flow, PathBuf::from("/m/fc.onnx"));
        assert_eq!(
            config.models.refinement,
            UpsamplerConfig::default().models.refinement
        );
        assert_eq!(config.inference.backend, InferenceBackend::Tensorrt);
        assert_eq!(config.inference.device_id, 1);
        assert_eq!(config.interpolation.blend_epsilon, 0.01);
    }

    #[test]
    fn absent_overrides_keep_config() {
        let cli = parse(&[]);
        let mut config = UpsamplerConfig::default();
        config.inference.backend = InferenceBackend::Cuda;
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.inference.backend, InferenceBackend::Cuda);
    }

    #[test]
    fn load_config_reads_explicit_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.toml");
        std::fs::write(&path, "[inference]\nbackend = \"cuda\"\n").unwrap();
        let cli = parse(&["--config", path.to_str().unwrap()]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.inference.backend, InferenceBackend::Cuda);
        assert_eq!(config.models.flow, tmp.path().join("models/flow_comp.onnx"));
    }
}
