//! Benchmark harness: stream a synthetic signal through every configured device.
//!
//! ```bash
//! cortex run.yaml            # 10 s of signal in real time
//! cortex run.yaml 60 --yaml  # 60 s, summary as YAML
//! cortex run.yaml 5 --speed 0 --load /usr/bin/stress-ng --load-arg=--cpu --load-arg=2
//! ```
//!
//! Ctrl-C stops the run after the current chunk; devices are still torn down and the
//! summary is printed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cortex::{Harness, LoadContext, MemorySink, RunConfig, RunSummary, SyntheticSource};

#[derive(Parser)]
#[command(name = "cortex", version, about = "CORTEX windowing and device benchmark harness")]
struct Cli {
    /// Run configuration (YAML).
    config: PathBuf,

    /// Seconds of signal to stream.
    #[arg(default_value_t = 10.0)]
    seconds: f64,

    /// Playback speed multiplier; 0 streams as fast as devices keep up.
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Print the summary as YAML instead of a table.
    #[arg(long)]
    yaml: bool,

    /// Program to run as background load for the duration of the run.
    #[arg(long)]
    load: Option<PathBuf>,

    /// Argument passed to the load program (repeatable).
    #[arg(long = "load-arg", allow_hyphen_values = true)]
    load_args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if !cli.seconds.is_finite() || cli.seconds <= 0.0 {
        bail!("seconds must be positive, got {}", cli.seconds);
    }

    let config = RunConfig::from_file(&cli.config)
        .with_context(|| format!("cannot load {}", cli.config.display()))?;
    let dataset = config.dataset.clone();
    let sink = MemorySink::new();

    // Spawning adapters and handshaking blocks.
    let setup_config = config.clone();
    let setup_sink = sink.clone();
    let mut harness = tokio::task::spawn_blocking(move || Harness::from_config(&setup_config, Box::new(setup_sink)))
        .await
        .context("device setup panicked")?
        .context("device setup failed")?;

    if let Some(program) = &cli.load {
        let load = LoadContext::start(program, &cli.load_args)
            .with_context(|| format!("cannot start background load {}", program.display()))?;
        harness = harness.with_load(load);
    }

    let source = SyntheticSource::new(dataset.channels, dataset.sample_rate_hz, dataset.hop_samples)?
        .with_duration(Duration::from_secs_f64(cli.seconds))
        .with_speed(cli.speed)?;

    let cancel = harness.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current chunk");
            cancel.cancel();
        }
    });

    info!(devices = config.devices.len(), seconds = cli.seconds, speed = cli.speed, "Starting run");
    let summary = harness.run(source).await.context("run failed")?;
    info!(records = sink.len(), "Telemetry collected");

    if cli.yaml {
        print!("{}", serde_yaml_ng::to_string(&summary)?);
    } else {
        print_table(&summary);
    }
    Ok(())
}

fn print_table(summary: &RunSummary) {
    println!(
        "windows dispatched: {}{}",
        summary.windows_dispatched,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    println!("{:<20} {:>10} {:>8} {:>8} {:>6}", "device", "completed", "failed", "missed", "error");
    for device in &summary.devices {
        let error = device.last_error_code.map_or_else(|| "-".to_string(), |code| code.to_string());
        println!(
            "{:<20} {:>10} {:>8} {:>8} {:>6}",
            device.name, device.windows_completed, device.windows_failed, device.deadlines_missed, error
        );
    }
    for skipped in &summary.skipped {
        println!("{:<20} skipped (error {}): {}", skipped.name, skipped.error_code, skipped.reason);
    }
}
