// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the supervisor state machine, restart policy and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use katago_bridge::engine::{Engine, MockEngine, ProcessController};
use katago_bridge::error::EngineError;
use katago_bridge::metrics::EngineStats;
use katago_bridge::supervisor::{Supervisor, SupervisorState};

use common::*;

const PROBE: Duration = Duration::from_millis(50);

fn supervised(engine: Arc<MockEngine>, probe_interval: Duration) -> Supervisor {
    Supervisor::new(engine, fast_supervisor_config(probe_interval))
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_start_reaches_running() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), PROBE);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    let token = CancellationToken::new();
    supervisor.start(&token).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    assert!(engine.is_running());
    assert_eq!(engine.start_count(), 1);
    assert_eq!(supervisor.restart_count(), 0);

    assert!(matches!(
        supervisor.start(&token).await,
        Err(EngineError::AlreadyRunning)
    ));

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_stop_is_reenterable() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), PROBE);
    let token = CancellationToken::new();

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    supervisor.start(&token).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    // Terminal state can be left again via start()
    supervisor.start(&token).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    assert_eq!(engine.start_count(), 2);
    supervisor.stop().await;
}

#[tokio::test]
async fn test_start_retries_until_success() {
    let engine = Arc::new(MockEngine::failing_starts(3));
    let supervisor = supervised(engine.clone(), PROBE);

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    assert_eq!(engine.start_count(), 4);
    // Initial start retries are not restarts
    assert_eq!(supervisor.restart_count(), 0);

    supervisor.stop().await;
}

// ============================================================================
// Recovery Tests
// ============================================================================

#[tokio::test]
async fn test_crash_recovery() {
    let engine = Arc::new(MockEngine::new());
    let metrics = Arc::new(EngineStats::new());
    let supervisor = supervised(engine.clone(), PROBE).with_metrics(metrics.clone());

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    let starts_before = engine.start_count();

    engine.crash();
    assert!(!engine.is_running());

    let recovered = wait_until(PROBE * 4, || {
        let engine = engine.clone();
        async move { engine.is_running() }
    })
    .await;
    assert!(recovered, "engine should be restarted within a probe interval");
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(1))
            .await
    );

    // Let a few more probes pass; a healthy engine is left alone
    tokio::time::sleep(PROBE * 3).await;
    assert_eq!(supervisor.restart_count(), 1);
    assert_eq!(engine.start_count(), starts_before + 1);
    assert_eq!(metrics.snapshot().restarts, 1);
    assert!(metrics.snapshot().health_ok >= 1);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_failed_ping_triggers_restart() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), PROBE);

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );

    let mut states = supervisor.subscribe();
    engine.set_fail_ping(true);
    let left_running = tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s != SupervisorState::Running),
    )
    .await;
    assert!(left_running.is_ok());
    assert!(
        wait_until(Duration::from_secs(1), || {
            let engine = engine.clone();
            async move { engine.stop_count() >= 1 }
        })
        .await
    );

    // Restart attempts keep failing their post-start ping until the engine heals
    engine.set_fail_ping(false);
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    assert_eq!(supervisor.restart_count(), 1);
    assert!(engine.is_running());

    supervisor.stop().await;
}

#[tokio::test]
async fn test_ping_timeout_triggers_restart() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), PROBE);

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );

    // Slower than the 200ms ping timeout
    engine.set_ping_delay(Duration::from_millis(500));
    assert!(
        wait_until(Duration::from_secs(3), || {
            let engine = engine.clone();
            async move { engine.stop_count() >= 1 }
        })
        .await
    );
    engine.set_ping_delay(Duration::ZERO);

    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(3))
            .await
    );
    assert!(supervisor.restart_count() >= 1);

    supervisor.stop().await;
}

// ============================================================================
// Manual Restart Tests
// ============================================================================

#[tokio::test]
async fn test_manual_restart_is_coalesced() {
    let engine = Arc::new(MockEngine::new());
    // Long probe interval so only manual restarts happen
    let supervisor = supervised(engine.clone(), Duration::from_secs(60));

    assert!(!supervisor.restart(), "restart while stopped is a no-op");

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );

    // No await between the two calls: the second one finds the first pending
    assert!(supervisor.restart());
    assert!(!supervisor.restart());

    assert!(
        wait_until(Duration::from_secs(2), || {
            let engine = engine.clone();
            async move { engine.start_count() == 2 && engine.is_running() }
        })
        .await
    );
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(1))
            .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.restart_count(), 1);
    assert_eq!(engine.stop_count(), 1);

    // A new request after the first completed is honoured
    assert!(supervisor.restart());
    assert!(
        wait_until(Duration::from_secs(2), || {
            let supervisor = &supervisor;
            async move { supervisor.restart_count() == 2 }
        })
        .await
    );

    supervisor.stop().await;
}

#[tokio::test]
async fn test_restart_requested_before_stop_is_discarded() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), Duration::from_secs(60));
    let token = CancellationToken::new();

    supervisor.start(&token).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );

    assert!(supervisor.restart());
    supervisor.stop().await;
    assert_eq!(engine.start_count(), 1);
    assert_eq!(engine.stop_count(), 1);

    supervisor.start(&token).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(engine.start_count(), 2, "no extra start after a fresh start()");
    assert_eq!(engine.stop_count(), 1);
    assert_eq!(supervisor.restart_count(), 0);
    assert_eq!(supervisor.state(), SupervisorState::Running);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_probe_cadence_does_not_drift() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), Duration::from_millis(100));

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );

    // Each ping takes most of a period; probes still start every 100ms
    engine.set_ping_delay(Duration::from_millis(60));
    let before = engine.ping_count();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let probes = engine.ping_count() - before;

    assert!(probes >= 8, "expected about 10 probes, got {}", probes);
    assert_eq!(supervisor.restart_count(), 0);

    supervisor.stop().await;
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[tokio::test]
async fn test_stop_aborts_retry_loop() {
    let engine = Arc::new(MockEngine::failing_starts(u32::MAX));
    let supervisor = supervised(engine.clone(), PROBE);

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let engine = engine.clone();
            async move { engine.start_count() >= 3 }
        })
        .await
    );
    assert_eq!(supervisor.state(), SupervisorState::Starting);

    tokio::time::timeout(Duration::from_secs(2), supervisor.stop())
        .await
        .expect("stop must not wait for the retry loop to succeed");
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    let attempts = engine.start_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.start_count(), attempts, "no attempts after stop");
}

#[tokio::test]
async fn test_external_cancellation_ends_supervision() {
    let engine = Arc::new(MockEngine::new());
    let supervisor = supervised(engine.clone(), PROBE);
    let token = CancellationToken::new();

    supervisor.start(&token).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(2))
            .await
    );

    token.cancel();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Stopped, Duration::from_secs(2))
            .await
    );
    // Cancellation alone does not stop the engine
    assert!(engine.is_running());
    assert_eq!(engine.stop_count(), 0);

    // Crashes are no longer recovered
    engine.crash();
    tokio::time::sleep(PROBE * 3).await;
    assert_eq!(engine.start_count(), 1);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_external_cancellation_aborts_start_retries() {
    let engine = Arc::new(MockEngine::failing_starts(u32::MAX));
    let supervisor = supervised(engine.clone(), PROBE);
    let token = CancellationToken::new();

    supervisor.start(&token).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    assert!(
        supervisor
            .wait_for_state(SupervisorState::Stopped, Duration::from_secs(2))
            .await
    );
    assert!(!engine.is_running());
}

// ============================================================================
// Process Controller Integration
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_supervisor_restarts_killed_engine_process() {
    let controller = Arc::new(mock_controller(&[]));
    let supervisor = Supervisor::new(
        controller.clone(),
        fast_supervisor_config(Duration::from_millis(100)),
    );

    supervisor.start(&CancellationToken::new()).await.unwrap();
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(5))
            .await
    );
    controller.send_query(&position(1)).await.unwrap();
    let first_pid = controller.pid().unwrap();

    signal::kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            let controller = controller.clone();
            async move { controller.pid().is_some_and(|pid| pid != first_pid) }
        })
        .await,
        "supervisor should start a new process"
    );
    assert!(
        supervisor
            .wait_for_state(SupervisorState::Running, Duration::from_secs(5))
            .await
    );
    assert_eq!(supervisor.restart_count(), 1);

    let response = controller.send_query(&position(2)).await.unwrap();
    assert_eq!(response.id(), "q1");

    supervisor.stop().await;
    assert!(!controller.is_running());
}
