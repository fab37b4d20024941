//! molbridge CLI
//!
//! Starts one worker behind a bridge, optionally verifies it with a handshake,
//! then relays every stdin line to it as a concurrent request and prints one
//! JSON result line per request on stdout.
//!
//! ```text
//! molbridge --handshake init=initialized -- python3 rdkit_worker.py < payloads.txt
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use molbridge::{Bridge, BridgeConfig, Handshake, StderrMode, WorkerClient, WorkerCommand};
use molbridge_cli::logging::init_tracing;
use molbridge_cli::relay::relay;

#[derive(Parser)]
#[command(name = "molbridge")]
#[command(version)]
#[command(about = "Relay payload lines to a worker process over a multiplexed stdio bridge")]
struct Cli {
    /// Per-request timeout in milliseconds (overrides MOLBRIDGE_TIMEOUT_MS)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Startup grace window in milliseconds (overrides MOLBRIDGE_STARTUP_GRACE_MS)
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Outbound queue capacity (overrides MOLBRIDGE_QUEUE_CAPACITY)
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Longest accepted reply line in bytes (overrides MOLBRIDGE_MAX_LINE_BYTES)
    #[arg(long)]
    max_line_bytes: Option<usize>,

    /// Startup handshake as <payload>=<expected>, e.g. init=initialized
    #[arg(long, value_parser = parse_handshake)]
    handshake: Option<Handshake>,

    /// Pass worker stderr straight through instead of logging it
    #[arg(long)]
    inherit_stderr: bool,

    /// Worker executable followed by its arguments (defaults to MOLBRIDGE_WORKER)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    worker: Vec<String>,
}

fn parse_handshake(raw: &str) -> Result<Handshake, String> {
    Handshake::parse(raw).map_err(|e| e.to_string())
}

impl Cli {
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::from_env().context("invalid MOLBRIDGE_* environment")?;
        if let Some(ms) = self.timeout_ms {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.grace_ms {
            config = config.with_startup_grace(Duration::from_millis(ms));
        }
        if let Some(capacity) = self.queue_capacity {
            config = config.with_queue_capacity(capacity);
        }
        if let Some(max) = self.max_line_bytes {
            config = config.with_max_line_bytes(max);
        }
        if let Some(handshake) = &self.handshake {
            config = config.with_handshake(handshake.clone());
        }
        Ok(config)
    }

    fn worker_command(&self) -> Result<WorkerCommand> {
        let command = match self.worker.split_first() {
            Some((program, args)) => WorkerCommand::new(program).with_args(args.iter().cloned()),
            None => WorkerCommand::from_env()
                .context("no worker given: pass one after `--` or set MOLBRIDGE_WORKER")?,
        };
        Ok(if self.inherit_stderr {
            command.with_stderr(StderrMode::Inherit)
        } else {
            command
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = cli.bridge_config()?;
    let command = cli.worker_command()?;
    let timeout = config.request_timeout;
    // Keep no more requests in flight than the bridge queue holds.
    let max_in_flight = config.queue_capacity;

    let bridge = Arc::new(
        Bridge::start(command, config)
            .await
            .context("failed to start worker")?,
    );
    let status = serde_json::to_string(&bridge.status())?;
    info!(%status, "Bridge started");

    let client: Arc<dyn WorkerClient> = bridge.clone();
    let relayed = relay(
        client,
        tokio::io::stdin(),
        tokio::io::stdout(),
        timeout,
        max_in_flight,
    );
    let outcome = tokio::select! {
        summary = relayed => Some(summary),
        _ = shutdown_signal() => None,
    };

    bridge.close().await;

    let Some(summary) = outcome else {
        return Ok(());
    };
    let summary = summary?;
    info!(
        sent = summary.sent,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Relay finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} of {} requests failed", summary.failed, summary.sent);
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
