//! Terminal Feed Bridge Binary
//!
//! Runs the session lifecycle against the simulated terminal and replays
//! push blocks read from stdin. Each emitted transaction is written to
//! stdout as one JSON line.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin terminal-feed-bridge < pushes.txt
//! ```
//!
//! Each input line is a push block, optionally followed by `|` and
//! whitespace-separated `code=value` fields:
//!
//! ```text
//!   A  20200302093015  X  1234.50  | ID=T-1
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `TERMINAL_REAL_NAME`: Push channel name
//! - `TERMINAL_SYMBOL`: Push channel key
//!
//! ## Optional
//! - `TERMINAL_NODE_NAME`: Node name in health output (default: terminal-feed-bridge)
//! - `TERMINAL_QUERY_TIMEOUT_MS`: Query and snapshot timeout (default: 5000)
//! - `TERMINAL_OUTPUT_FIELDS`: Output field codes for queries
//! - `BRIDGE_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `BRIDGE_QUERY_RANGE`: `start:end` date-time sequences; runs one query after connect
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use terminal_feed_bridge::infrastructure::bridge::{BridgeSession, replay_push};
use terminal_feed_bridge::infrastructure::health::{HealthServer, HealthServerState};
use terminal_feed_bridge::infrastructure::telemetry;
use terminal_feed_bridge::{
    BridgeConfig, SessionController, SharedTransport, SimulatedTerminal, TransactionStream,
    init_metrics, terminal_channels,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for replayed pushes to be normalized.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while draining.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Terminal Feed Bridge");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = BridgeConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (callbacks, receivers) = terminal_channels();
    let terminal = Arc::new(SimulatedTerminal::new(callbacks));
    let transport: SharedTransport = terminal.clone();
    let session = BridgeSession::assemble(transport, receivers, &config);
    let controller = Arc::clone(session.controller());

    let pump = session.spawn_pump(shutdown_token.clone());

    controller.connect()?;
    let stream = controller
        .transaction_stream()
        .context("transaction stream already claimed")?;
    let printer = tokio::spawn(print_transactions(stream));

    // Spawn health server
    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            config.terminal.node_name.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            &session,
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    if let Some((start, end)) = query_range() {
        run_query(&controller, &config, &start, &end).await;
    }

    tracing::info!("Bridge ready, replaying pushes from stdin");

    let delivered = tokio::select! {
        delivered = replay_stdin(&terminal, &config) => delivered,
        () = await_shutdown() => 0,
    };

    if delivered > 0 {
        drain(&session, delivered).await;
    }

    let report = controller.disconnect();
    tracing::info!(reason = %report, "Teardown finished");

    shutdown_token.cancel();
    if let Some(pump) = pump {
        let _ = pump.await;
    }
    let _ = printer.await;

    tracing::info!("Terminal Feed Bridge stopped");
    Ok(())
}

/// Feed stdin lines to the terminal until EOF. Returns the number of
/// pushes delivered.
async fn replay_stdin(terminal: &SimulatedTerminal, config: &BridgeConfig) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut delivered = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match replay_push(&config.channel, &line) {
                Ok(push) => {
                    if terminal.push(push) {
                        delivered += 1;
                    }
                }
                Err(e) => tracing::warn!(error = %e, %line, "Skipping unreadable replay line"),
            },
            Ok(None) => {
                tracing::info!(delivered, "Replay input exhausted");
                return delivered;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                return delivered;
            }
        }
    }
}

/// Wait until every delivered push consumed a sequence number.
async fn drain(session: &BridgeSession, delivered: u64) {
    let normalizer = session.normalizer();
    let waited = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while normalizer.emitted() < delivered {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    })
    .await;

    if waited.is_err() {
        tracing::warn!(
            delivered,
            emitted = normalizer.emitted(),
            "Pushes still pending at shutdown"
        );
    }
}

/// Write each transaction to stdout as one JSON line.
async fn print_transactions(mut stream: TransactionStream) {
    let channel = stream.channel().clone();
    while let Some(transaction) = stream.next().await {
        tracing::info!(
            %channel,
            sequence = transaction.local_sequence,
            remote_id = ?transaction.remote_id,
            price = ?transaction.price,
            duplicate_suspect = transaction.is_duplicate_suspect(),
            "Transaction"
        );
        match serde_json::to_string(&transaction) {
            Ok(json) => {
                if let Err(e) = write_line(&json) {
                    tracing::error!(error = %e, "Failed to write transaction");
                    return;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize transaction"),
        }
    }
    tracing::debug!(%channel, "Transaction stream closed");
}

fn write_line(line: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()
}

/// Run the configured date-range query and write each row to stdout.
async fn run_query(controller: &SessionController, config: &BridgeConfig, start: &str, end: &str) {
    match controller
        .query_fields(start, end, &config.output_fields)
        .await
    {
        Ok(rows) => {
            tracing::info!(start, end, rows = rows.len(), "Query completed");
            for row in rows {
                match serde_json::to_string(&row) {
                    Ok(json) => {
                        if let Err(e) = write_line(&json) {
                            tracing::error!(error = %e, "Failed to write row");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to serialize row"),
                }
            }
        }
        Err(e) => tracing::error!(start, end, error = %e, kind = e.kind().as_str(), "Query failed"),
    }
}

/// `BRIDGE_QUERY_RANGE` as `(start, end)`.
fn query_range() -> Option<(String, String)> {
    let raw = std::env::var("BRIDGE_QUERY_RANGE").ok()?;
    match raw.split_once(':') {
        Some((start, end)) => Some((start.trim().to_string(), end.trim().to_string())),
        None => {
            tracing::warn!(%raw, "BRIDGE_QUERY_RANGE must be start:end");
            None
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        channel = %config.channel,
        node = %config.terminal.node_name,
        health_port = config.server.health_port,
        query_timeout_ms = config.query.timeout.as_millis(),
        "Configuration loaded"
    );
    tracing::debug!(
        program_id = %config.terminal.program_id,
        credentials = ?config.terminal.credentials,
        output_fields = %config.output_fields,
        "Terminal settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
