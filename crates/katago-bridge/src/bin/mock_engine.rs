// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted stand-in for the KataGo analysis engine.
//!
//! Speaks the same line-delimited JSON protocol on stdio. Queries are
//! answered on their own task, so a per-query `delayMs` field produces
//! out-of-order responses. `health` requests are always answered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Answer with the query echoed back
    Echo,
    /// Never answer queries
    Silent,
    /// Answer with a plain error message
    Error,
    /// Answer with a structured error
    StructuredError,
    /// Emit unparseable lines, unknown IDs and warnings before each answer
    Garbage,
}

#[derive(Debug, Parser)]
#[command(name = "mock-engine", about = "Scripted analysis engine for tests")]
struct Args {
    /// Response behaviour
    #[arg(long, value_enum, default_value_t = Mode::Echo)]
    mode: Mode,

    /// Delay before each answer, unless the query sets `delayMs`
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Exit with status 3 after answering this many queries
    #[arg(long)]
    exit_after: Option<u64>,

    /// Keep running after stdin closes
    #[arg(long)]
    ignore_eof: bool,

    /// Ignore SIGTERM
    #[arg(long)]
    ignore_term: bool,

    /// Engine arguments that are accepted and ignored
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    eprintln!("mock engine starting: mode={:?} args={:?}", args.mode, args.rest);

    if args.ignore_term {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            while term.recv().await.is_some() {
                eprintln!("mock engine ignoring SIGTERM");
            }
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let answered = Arc::new(AtomicU64::new(0));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let Ok(Value::Object(query)) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock engine: unparseable request: {}", line);
            continue;
        };
        let id = query
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if id == "health" {
            let _ = tx.send(json!({ "id": "health", "version": "1.0-mock" }).to_string());
            continue;
        }
        if args.mode == Mode::Silent {
            continue;
        }

        let delay = query
            .get("delayMs")
            .and_then(Value::as_u64)
            .unwrap_or(args.delay_ms);
        let tx = tx.clone();
        let answered = answered.clone();
        let mode = args.mode;
        let exit_after = args.exit_after;

        tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if mode == Mode::Garbage {
                let _ = tx.send("KataGo mock: this is not JSON".to_string());
                let _ = tx.send(String::new());
                let _ = tx.send(json!({ "id": "q999999", "turnNumber": 0 }).to_string());
                let _ = tx.send(json!({ "id": "startup", "note": "late" }).to_string());
                let _ = tx.send(
                    json!({ "id": id, "warning": "mock warning", "field": "mock" }).to_string(),
                );
            }
            let _ = tx.send(reply(mode, &id, query).to_string());

            let n = answered.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(limit) = exit_after
                && n >= limit
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
                eprintln!("mock engine exiting after {} answers", n);
                std::process::exit(3);
            }
        });
    }

    eprintln!("mock engine: stdin closed");
    if args.ignore_eof {
        std::future::pending::<()>().await;
    }

    drop(tx);
    writer.await??;
    Ok(())
}

fn reply(mode: Mode, id: &str, mut query: Map<String, Value>) -> Value {
    match mode {
        Mode::Error => json!({ "id": id, "error": "mock failure" }),
        Mode::StructuredError => json!({
            "id": id,
            "error": { "code": "E_MOCK", "message": "mock failure" }
        }),
        _ => {
            query.remove("id");
            let visits = query.get("maxVisits").and_then(Value::as_u64).unwrap_or(1);
            json!({
                "id": id,
                "turnNumber": 0,
                "moveInfos": [],
                "rootInfo": { "visits": visits, "winrate": 0.5 },
                "echo": query,
            })
        }
    }
}
