//! Adapter process serving built-in kernels.
//!
//! ```bash
//! # Spawned by the harness for local:// devices (stdin/stdout are the transport)
//! cortex-adapter
//!
//! # Standalone on a remote machine, waiting for the harness to dial in
//! RUST_LOG=debug cortex-adapter tcp://:9000
//! ```
//!
//! Logs always go to stderr; stdout may be carrying frames.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cortex::adapter::{AdapterOptions, serve};
use cortex::protocol::ACCEPT_TIMEOUT;
use cortex::transport::uri;
use cortex::{KernelRegistry, Role, TransportUri};

#[derive(Parser)]
#[command(name = "cortex-adapter", version, about = "CORTEX device adapter")]
struct Cli {
    /// Transport to serve on: local://, tcp://:PORT, serial:///PATH or shm://NAME.
    #[arg(default_value = "local://")]
    uri: String,

    /// Name reported to the harness in HELLO.
    #[arg(long, default_value = "cortex-adapter")]
    name: String,

    /// How long tcp://:PORT waits for the harness, in milliseconds.
    #[arg(long, default_value_t = ACCEPT_TIMEOUT.as_millis() as u64)]
    accept_timeout_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let uri: TransportUri = cli.uri.parse().with_context(|| format!("bad transport URI '{}'", cli.uri))?;
    let mut transport = uri::open(&uri, Role::Adapter, Duration::from_millis(cli.accept_timeout_ms))
        .with_context(|| format!("cannot open {}", uri))?;

    let registry = KernelRegistry::builtin();
    info!(%uri, kernels = ?registry.names().collect::<Vec<_>>(), "Adapter ready");

    let options = AdapterOptions { name: cli.name, ..Default::default() };
    let stats = serve(transport.as_mut(), &registry, &options).context("session failed")?;
    info!(
        session = %format!("{:#010x}", stats.session_id),
        kernel = %stats.kernel,
        windows = stats.windows_processed,
        failed = stats.windows_failed,
        "Session ended"
    );
    Ok(())
}
