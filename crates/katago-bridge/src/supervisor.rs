// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine supervision: start, liveness probing, and restart.
//!
//! The supervisor runs one background task that walks this state machine:
//!
//! ```text
//! Stopped ──start()──▶ Starting ──ok──▶ Running ──probe fails──▶ Unhealthy
//!    ▲                    ▲  ▲             │                         │
//!    │                    │  └─restart()───┘                         │
//!    │                    └──────────────────────────────────────────┘
//!    └──────────────── stop() / cancellation (from any state)
//! ```
//!
//! Starting runs the engine's `start()` followed by a bounded `ping()` under
//! the [`RetryExecutor`], retrying until success or cancellation. In Running,
//! the engine is probed every `probe_interval`; a false `is_running()` or a
//! failed or timed-out ping counts as unhealthy and triggers stop-then-start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::metrics::{EngineMetrics, NoopMetrics};
use crate::retry::{RetryError, RetryExecutor};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Not supervising. Initial and terminal state.
    Stopped,
    /// Starting the engine, possibly retrying.
    Starting,
    /// Engine started and passing probes.
    Running,
    /// A probe failed; a restart follows.
    Unhealthy,
}

impl SupervisorState {
    /// Whether moving from `self` to `next` is legal.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Unhealthy)
                | (Running, Starting)
                | (Unhealthy, Starting)
                | (_, Stopped)
        )
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

struct Inner {
    state: watch::Sender<SupervisorState>,
    restarts: AtomicU64,
}

impl Inner {
    /// Apply a guarded transition. Illegal transitions are logged and ignored.
    fn transition(&self, next: SupervisorState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "Ignoring illegal supervisor transition");
                return false;
            }
            debug!(from = %current, to = %next, "Supervisor state changed");
            *current = next;
            true
        })
    }
}

struct Run {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps an [`Engine`] running.
pub struct Supervisor {
    engine: Arc<dyn Engine>,
    config: SupervisorConfig,
    metrics: Arc<dyn EngineMetrics>,
    inner: Arc<Inner>,
    run: tokio::sync::Mutex<Option<Run>>,
    /// Restart requests for the current run. Single slot, so requests made
    /// while one is pending are coalesced.
    restart_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Supervisor {
    /// Create a stopped supervisor for `engine`.
    pub fn new(engine: Arc<dyn Engine>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            engine,
            config,
            metrics: Arc::new(NoopMetrics),
            inner: Arc::new(Inner {
                state,
                restarts: AtomicU64::new(0),
            }),
            run: tokio::sync::Mutex::new(None),
            restart_tx: Mutex::new(None),
        }
    }

    /// Report restarts and probe results to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The supervised engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    /// Wait until the supervisor reaches `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: SupervisorState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        )
    }

    /// Number of restarts performed since construction.
    pub fn restart_count(&self) -> u64 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Begin supervising. Returns immediately; the engine is started in the
    /// background with retries.
    ///
    /// Cancelling `cancel` ends supervision without stopping the engine.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut run = self.run.lock().await;
        if self.state() != SupervisorState::Stopped {
            return Err(EngineError::AlreadyRunning);
        }
        // A previous run may have ended on its own (cancellation, exhausted retries).
        if let Some(old) = run.take() {
            old.token.cancel();
            let _ = old.handle.await;
        }

        // Requests made during an earlier run die with its channel.
        let (restart_tx, restart_rx) = mpsc::channel(1);
        *self.restart_slot() = Some(restart_tx);
        self.inner.transition(SupervisorState::Starting);

        let token = cancel.child_token();
        let task = SupervisorTask {
            engine: self.engine.clone(),
            inner: self.inner.clone(),
            metrics: self.metrics.clone(),
            retry: RetryExecutor::new(self.config.retry.clone()),
            config: self.config.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run(restart_rx));
        *run = Some(Run { token, handle });

        info!(
            engine = self.engine.engine_type(),
            probe_interval_ms = self.config.probe_interval_ms,
            "Supervisor started"
        );
        Ok(())
    }

    /// Request a stop-then-start cycle.
    ///
    /// Returns false if the supervisor is stopped or a restart is already
    /// pending; requests are coalesced.
    pub fn restart(&self) -> bool {
        if self.state() == SupervisorState::Stopped {
            return false;
        }
        match self.restart_slot().as_ref().map(|tx| tx.try_send(())) {
            Some(Ok(())) => true,
            Some(Err(_)) => {
                debug!("Restart already pending");
                false
            }
            None => false,
        }
    }

    fn restart_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<()>>> {
        self.restart_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop supervising and stop the engine. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.restart_slot().take();
        let run = self.run.lock().await.take();
        if let Some(run) = run {
            run.token.cancel();
            if let Err(e) = run.handle.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
        self.inner.state.send_replace(SupervisorState::Stopped);
        self.engine.stop().await;
        info!("Supervisor stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Ok(mut run) = self.run.try_lock()
            && let Some(run) = run.take()
        {
            run.token.cancel();
        }
    }
}

/// State owned by the background supervision task.
struct SupervisorTask {
    engine: Arc<dyn Engine>,
    inner: Arc<Inner>,
    metrics: Arc<dyn EngineMetrics>,
    retry: RetryExecutor,
    config: SupervisorConfig,
    token: CancellationToken,
}

impl SupervisorTask {
    async fn run(self, mut restarts: mpsc::Receiver<()>) {
        if self.start_with_retry().await {
            self.supervise(&mut restarts).await;
        }
        self.inner.state.send_replace(SupervisorState::Stopped);
        debug!("Supervisor task exited");
    }

    async fn supervise(&self, restarts: &mut mpsc::Receiver<()>) {
        // A zero period would panic in `interval_at`.
        let period = self.config.probe_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                Some(()) = restarts.recv() => {
                    info!("Manual engine restart requested");
                    self.inner.transition(SupervisorState::Starting);
                    if !self.restart().await {
                        return;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    let healthy = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return,
                        result = self.check_health() => result,
                    };
                    match healthy {
                        Ok(()) => self.metrics.health_check(true),
                        Err(e) => {
                            self.metrics.health_check(false);
                            warn!(error = %e, "Engine unhealthy, restarting");
                            self.inner.transition(SupervisorState::Unhealthy);
                            self.inner.transition(SupervisorState::Starting);
                            if !self.restart().await {
                                return;
                            }
                            ticker.reset();
                        }
                    }
                }
            }
        }
    }

    async fn check_health(&self) -> Result<()> {
        if !self.engine.is_running() {
            return Err(EngineError::ProcessUnhealthy(
                "engine not running".to_string(),
            ));
        }
        let timeout = self.config.ping_timeout();
        match tokio::time::timeout(timeout, self.engine.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::ProcessUnhealthy(e.to_string())),
            Err(_) => Err(EngineError::ProcessUnhealthy(format!(
                "ping timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Stop the engine and bring it back. Returns false if supervision ended.
    async fn restart(&self) -> bool {
        self.engine.stop().await;
        let count = self.inner.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.engine_restart();
        info!(restarts = count, "Restarting engine");
        self.start_with_retry().await
    }

    /// Run the Starting state. Returns true once the engine is Running.
    async fn start_with_retry(&self) -> bool {
        let attempt = |attempt: u32| async move {
            debug!(attempt, "Starting engine");
            match self.engine.start().await {
                Ok(()) | Err(EngineError::AlreadyRunning) => {}
                Err(e) => return Err(e),
            }

            let timeout = self.config.start_ping_timeout();
            let ping = match tokio::time::timeout(timeout, self.engine.ping()).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::ProcessUnhealthy(format!(
                    "start ping timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            if let Err(e) = ping {
                self.engine.stop().await;
                return Err(e);
            }
            Ok(())
        };

        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(RetryError::Cancelled),
            result = self.retry.run(&self.token, attempt) => result,
        };

        match result {
            Ok(()) => {
                self.inner.transition(SupervisorState::Running);
                info!("Engine running under supervision");
                true
            }
            Err(RetryError::Cancelled) => {
                info!("Engine start cancelled");
                false
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(attempts, error = %last, "Giving up on engine start");
                false
            }
        }
    }
}
