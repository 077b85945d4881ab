// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for katago-bridge integration tests.
//!
//! Engines are played by the `mock-engine` binary built alongside the tests.

#![allow(dead_code)]

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::json;

use katago_bridge::config::{EngineConfig, SupervisorConfig};
use katago_bridge::engine::ProcessController;
use katago_bridge::protocol::Query;
use katago_bridge::retry::RetryConfig;

/// Path to the scripted engine.
pub const MOCK_ENGINE: &str = env!("CARGO_BIN_EXE_mock-engine");

/// Engine config running `mock-engine` with the given flags.
///
/// Grace periods are short so tests that stop the engine finish quickly,
/// and protocol health probes are off unless a test enables them.
pub fn mock_engine_config(flags: &[&str]) -> EngineConfig {
    EngineConfig::new(MOCK_ENGINE)
        .with_subcommand("")
        .with_args(flags.iter().copied())
        .with_query_timeout(Duration::from_secs(5))
        .with_grace_periods(Duration::from_millis(500), Duration::from_millis(500))
        .with_health_interval(Duration::ZERO)
}

/// A stopped controller for `mock-engine` with the given flags.
pub fn mock_controller(flags: &[&str]) -> ProcessController {
    ProcessController::new(mock_engine_config(flags))
}

/// Supervisor config with fast probes and retries.
pub fn fast_supervisor_config(probe_interval: Duration) -> SupervisorConfig {
    SupervisorConfig::default()
        .with_probe_interval(probe_interval)
        .with_ping_timeout(Duration::from_millis(200))
        .with_retry(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_jitter(0.0),
        )
}

/// A 19x19 position query tagged so its echo can be matched.
pub fn position(tag: u64) -> Query {
    Query::new()
        .with("rules", "tromp-taylor")
        .with("komi", 7.5)
        .with("boardXSize", 19)
        .with("boardYSize", 19)
        .with("moves", json!([["B", "Q16"], ["W", "D4"]]))
        .with("tag", tag)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
