// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KataGo Bridge - command line front end
//!
//! Reads one JSON query per line from stdin, forwards each to a supervised
//! engine concurrently, and prints one JSON response per line to stdout.
//! The caller's own `id` field, if any, is echoed back. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use katago_bridge::cache::ResultCache;
use katago_bridge::config::Config;
use katago_bridge::engine::ProcessController;
use katago_bridge::metrics::EngineStats;
use katago_bridge::protocol::Query;
use katago_bridge::supervisor::{Supervisor, SupervisorState};

#[derive(Debug, Parser)]
#[command(name = "katago-bridge", version, about = "Supervised stdio bridge to a KataGo analysis engine")]
struct Args {
    /// JSON config file
    #[arg(short, long, env = "KATAGO_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Engine binary, overriding config and environment
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Disable the result cache
    #[arg(long)]
    no_cache: bool,

    /// Seconds to wait for the engine to come up before reading queries
    #[arg(long, default_value_t = 60)]
    startup_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging on stderr; stdout carries responses
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "katago_bridge=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        debug!("No .env file loaded: {}", e);
    }

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(binary) = args.binary {
        config.engine.binary_path = binary;
    }
    if args.no_cache {
        config.cache.enabled = false;
    }
    config.validate()?;

    info!(
        binary = %config.engine.binary_path.display(),
        cache_enabled = config.cache.enabled,
        query_timeout_ms = config.engine.query_timeout().as_millis() as u64,
        "Starting KataGo bridge"
    );

    let metrics = Arc::new(EngineStats::new());
    let cache = Arc::new(ResultCache::new(&config.cache));
    let controller = Arc::new(
        ProcessController::new(config.engine.clone())
            .with_cache(cache.clone())
            .with_metrics(metrics.clone()),
    );
    let supervisor =
        Supervisor::new(controller.clone(), config.supervisor.clone()).with_metrics(metrics.clone());

    let shutdown = CancellationToken::new();
    supervisor.start(&shutdown).await?;

    if !supervisor
        .wait_for_state(
            SupervisorState::Running,
            Duration::from_secs(args.startup_timeout),
        )
        .await
    {
        warn!(
            state = %supervisor.state(),
            "Engine not running yet, queries may fail until it starts"
        );
    }

    // Single writer keeps response lines whole
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                in_flight.abort_all();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let controller = controller.clone();
                    let out_tx = out_tx.clone();
                    in_flight.spawn(async move {
                        let reply = handle_line(&controller, &line).await;
                        let _ = out_tx.send(format!("{}\n", reply)).await;
                    });
                }
                Ok(None) => {
                    info!("Input closed, waiting for in-flight queries");
                    while in_flight.join_next().await.is_some() {}
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read input");
                    break;
                }
            },
        }
    }

    drop(out_tx);
    let _ = writer.await;

    shutdown.cancel();
    supervisor.stop().await;

    info!(
        cache = ?cache.stats(),
        engine = ?metrics.snapshot(),
        restarts = supervisor.restart_count(),
        "KataGo bridge shut down"
    );
    Ok(())
}

/// Run one input line through the engine and render the reply line.
async fn handle_line(controller: &ProcessController, line: &str) -> Value {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return json!({ "error": format!("invalid JSON: {}", e) }),
    };
    let caller_id = parsed.get("id").cloned().unwrap_or(Value::Null);

    let query = match Query::try_from(parsed) {
        Ok(query) => query,
        Err(e) => return json!({ "id": caller_id, "error": e.to_string() }),
    };

    match controller.send_query(&query).await {
        Ok(response) => {
            let mut raw = response.raw().clone();
            raw.insert("id".to_string(), caller_id);
            Value::Object(raw)
        }
        Err(e) => json!({ "id": caller_id, "error": e.to_string() }),
    }
}
