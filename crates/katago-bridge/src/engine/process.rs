// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process controller for a single engine instance.
//!
//! The controller spawns the engine with piped stdio and runs up to three
//! background tasks per process generation:
//!
//! - **stdout reader**: decodes response lines and hands each one to the
//!   pending query with the matching ID
//! - **stderr logger**: forwards diagnostics to `tracing` at debug level
//! - **health prober** (optional): sends `health` requests on an interval
//!
//! A generation counter is bumped on every start. Tasks and writes tagged
//! with an older generation never touch the current process's queries.
//!
//! # Locking
//!
//! Engine state (running flag, child handle, pending table, query counter)
//! sits under one short-lived `std::sync::Mutex`. Writes to stdin are
//! serialized by a separate async mutex, so a slow pipe never blocks the
//! reader delivering responses. Start and stop are serialized by a third
//! lifecycle mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pending::PendingTable;
use super::traits::Engine;
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::metrics::{EngineMetrics, NoopMetrics};
use crate::protocol::{self, HEALTH_ID, Query, Response, STARTUP_ID};

/// Mutable engine state guarded by [`Shared::state`].
#[derive(Debug, Default)]
struct EngineState {
    running: bool,
    /// Set by the reader when stdout closes before `stop()`.
    output_closed: bool,
    generation: u64,
    next_id: u64,
    pid: Option<u32>,
    child: Option<Child>,
    pending: PendingTable,
    tasks: Option<CancellationToken>,
}

struct Writer {
    generation: u64,
    stdin: ChildStdin,
    /// Set while a line is being written. Still set if that write was
    /// abandoned, leaving a partial line in the pipe.
    partial: bool,
}

/// State shared with the background tasks.
struct Shared {
    state: Mutex<EngineState>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    health_tx: mpsc::Sender<()>,
    health_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        // No critical section can leave the state half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one stdout line.
    fn dispatch_line(&self, generation: u64, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let response = match Response::decode(line) {
            Ok(response) => response,
            Err(e) => {
                warn!(line = %line, error = %e, "Failed to parse engine output");
                return;
            }
        };

        match response.id() {
            HEALTH_ID => {
                // Single slot: a second unread answer is dropped.
                let _ = self.health_tx.try_send(());
                return;
            }
            STARTUP_ID => {
                debug!("Received startup output, ignoring");
                return;
            }
            _ => {}
        }

        if response.is_warning_only() {
            warn!(
                id = %response.id(),
                warning = response.warning().unwrap_or_default(),
                "Engine reported a warning"
            );
            return;
        }

        let Some(n) = protocol::parse_query_id(response.id()) else {
            warn!(id = %response.id(), "Received response for unknown query");
            return;
        };

        let slot = {
            let mut state = self.state();
            if state.generation != generation {
                None
            } else {
                state.pending.take(n)
            }
        };

        match slot {
            Some(slot) => {
                debug!(id = %response.id(), has_error = response.error().is_some(), "Received response");
                // The caller may have given up already.
                let _ = slot.send(Ok(response));
            }
            None => warn!(id = %response.id(), "Received response for unknown query"),
        }
    }

    /// Fail every pending query of `generation` after its output closed.
    fn output_closed(&self, generation: u64) {
        let drained = {
            let mut state = self.state();
            if state.generation != generation || !state.running {
                return;
            }
            state.output_closed = true;
            state.pending.drain()
        };

        if !drained.is_empty() {
            warn!(count = drained.len(), "Engine output closed with queries in flight");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(EngineError::Transport(
                "engine output closed".to_string(),
            )));
        }
    }

    /// Drop the pending entry for a query whose caller stopped waiting.
    fn abandon(&self, generation: u64, n: u64) {
        let mut state = self.state();
        if state.generation == generation {
            state.pending.take(n);
        }
    }

    async fn write_line(&self, generation: u64, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut().filter(|w| w.generation == generation) else {
            return Err(EngineError::Stopped);
        };
        if w.partial {
            return Err(EngineError::Transport(
                "engine stdin is blocked by an unfinished write".to_string(),
            ));
        }

        w.partial = true;
        w.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::Transport(format!("write to engine failed: {}", e)))?;
        w.stdin
            .flush()
            .await
            .map_err(|e| EngineError::Transport(format!("flush to engine failed: {}", e)))?;
        w.partial = false;
        Ok(())
    }

    /// Whether a write to `generation`'s stdin was abandoned midway.
    fn stdin_blocked(&self, generation: u64) -> bool {
        // A held lock means a write is in progress, which is not yet a stall.
        match self.writer.try_lock() {
            Ok(writer) => writer
                .as_ref()
                .is_some_and(|w| w.generation == generation && w.partial),
            Err(_) => false,
        }
    }

    async fn probe(&self, generation: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.health_rx.lock().await;
        // Discard answers to earlier probes.
        while rx.try_recv().is_ok() {}

        let line = format!(
            "{}\n",
            serde_json::json!({ "id": HEALTH_ID, "action": "query_version" })
        );
        self.write_line(generation, &line).await?;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(())) => Ok(()),
            Ok(None) => Err(EngineError::Transport("health channel closed".to_string())),
            Err(_) => Err(EngineError::ProcessUnhealthy(format!(
                "no health answer within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// Owns one engine process and correlates its responses to callers.
///
/// # Example
///
/// ```ignore
/// let controller = ProcessController::new(config.engine.clone())
///     .with_cache(Arc::new(ResultCache::new(&config.cache)))
///     .with_metrics(metrics.clone());
/// controller.start().await?;
/// let response = controller.send_query(&query).await?;
/// ```
pub struct ProcessController {
    config: EngineConfig,
    cache: Arc<ResultCache>,
    metrics: Arc<dyn EngineMetrics>,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ProcessController {
    /// Create a stopped controller with caching disabled and no metrics.
    pub fn new(config: EngineConfig) -> Self {
        let (health_tx, health_rx) = mpsc::channel(1);
        Self {
            config,
            cache: Arc::new(ResultCache::disabled()),
            metrics: Arc::new(NoopMetrics),
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::default()),
                writer: tokio::sync::Mutex::new(None),
                health_tx,
                health_rx: tokio::sync::Mutex::new(health_rx),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Share a result cache with this controller.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Report events to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared result cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// OS process ID of the running engine.
    pub fn pid(&self) -> Option<u32> {
        self.shared.state().pid
    }

    /// Number of queries awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Whether the query with wire ID `id` is still awaiting a response.
    pub fn contains_pending(&self, id: &str) -> bool {
        protocol::parse_query_id(id).is_some_and(|n| self.shared.state().pending.contains(n))
    }

    /// Launch the engine process and its background tasks.
    ///
    /// Returns once the process is spawned; the engine may still be loading
    /// its model when the first query arrives.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shared.state().running {
            return Err(EngineError::AlreadyRunning);
        }

        let mut child = Command::new(&self.config.binary_path)
            .args(self.config.args())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(EngineError::Transport(
                "engine stdio was not captured".to_string(),
            ));
        };
        let pid = child.id();
        let tasks = CancellationToken::new();

        let generation = {
            let state = self.shared.state();
            state.generation + 1
        };
        *self.shared.writer.lock().await = Some(Writer {
            generation,
            stdin,
            partial: false,
        });

        {
            let mut state = self.shared.state();
            state.generation = generation;
            state.next_id = 0;
            state.running = true;
            state.output_closed = false;
            state.pid = pid;
            state.child = Some(child);
            state.tasks = Some(tasks.clone());
        }

        tokio::spawn(read_stdout(
            self.shared.clone(),
            generation,
            stdout,
            tasks.clone(),
        ));
        tokio::spawn(read_stderr(stderr, tasks.clone()));
        if let Some(interval) = self.config.health_interval() {
            tokio::spawn(health_loop(
                self.shared.clone(),
                self.metrics.clone(),
                generation,
                interval,
                self.config.health_timeout(),
                tasks,
            ));
        }

        self.metrics.engine_status(true);
        info!(
            pid = pid.unwrap_or_default(),
            binary = %self.config.binary_path.display(),
            generation,
            "Engine started"
        );
        Ok(())
    }

    /// Stop the engine. Idempotent.
    ///
    /// Pending queries fail with [`EngineError::Stopped`] immediately. The
    /// process gets `stop_grace` to exit after stdin closes, then SIGTERM and
    /// `term_grace`, then SIGKILL.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let (child, drained, tasks, generation) = {
            let mut state = self.shared.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.pid = None;
            (
                state.child.take(),
                state.pending.drain(),
                state.tasks.take(),
                state.generation,
            )
        };

        if !drained.is_empty() {
            info!(count = drained.len(), "Failing in-flight queries on stop");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(EngineError::Stopped));
        }

        if let Some(tasks) = tasks {
            tasks.cancel();
        }

        // Closing stdin asks the engine to finish and exit. The grace period
        // starts now, whether or not a writer still holds stdin.
        let grace_deadline = tokio::time::Instant::now() + self.config.stop_grace();
        match tokio::time::timeout_at(grace_deadline, self.shared.writer.lock()).await {
            Ok(mut writer) => {
                writer.take();
            }
            Err(_) => warn!("Engine stdin busy, skipping graceful close"),
        }

        if let Some(child) = child {
            self.terminate(child, grace_deadline).await;
        }

        self.metrics.engine_status(false);
        info!(generation, "Engine stopped");
    }

    async fn terminate(&self, mut child: Child, grace_deadline: tokio::time::Instant) {
        let grace = self.config.stop_grace();
        match tokio::time::timeout_at(grace_deadline, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(status = %status, "Engine exited");
                return;
            }
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for engine exit"),
            Err(_) => warn!(
                grace_ms = grace.as_millis() as u64,
                "Engine did not exit after stdin closed, sending SIGTERM"
            ),
        }

        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid, "Sent SIGTERM to engine"),
                Err(nix::errno::Errno::ESRCH) => debug!(pid, "Engine already gone (ESRCH)"),
                Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM to engine"),
            }

            if let Ok(Ok(status)) =
                tokio::time::timeout(self.config.term_grace(), child.wait()).await
            {
                debug!(status = %status, "Engine exited after SIGTERM");
                return;
            }
            warn!(pid, "Engine ignored SIGTERM, killing");
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill engine process");
        }
    }

    /// Current running flag.
    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    /// Check that the engine process has not exited and still accepts input.
    ///
    /// An engine that stopped reading stdin, so that a query write timed out
    /// midway, is reported unhealthy.
    pub fn ping(&self) -> Result<()> {
        let generation = {
            let mut state = self.shared.state();
            if !state.running {
                return Err(EngineError::NotRunning);
            }
            let Some(child) = state.child.as_mut() else {
                return Err(EngineError::ProcessUnhealthy(
                    "engine process not found".to_string(),
                ));
            };
            if let Some(status) = child.try_wait()? {
                return Err(EngineError::ProcessUnhealthy(format!(
                    "engine exited with {}",
                    status
                )));
            }
            state.generation
        };

        if self.shared.stdin_blocked(generation) {
            return Err(EngineError::ProcessUnhealthy(
                "engine stopped reading its input".to_string(),
            ));
        }
        Ok(())
    }

    /// Round-trip a `health` request through the engine.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let generation = {
            let state = self.shared.state();
            if !state.running {
                return Err(EngineError::NotRunning);
            }
            state.generation
        };
        self.shared.probe(generation, timeout).await
    }

    /// Send a query and wait for its response.
    ///
    /// Cached responses are returned without contacting the engine. Fails
    /// with [`EngineError::QueryTimeout`] if no response arrives within the
    /// configured query timeout.
    pub async fn send_query(&self, query: &Query) -> Result<Arc<Response>> {
        self.execute(query, None).await
    }

    /// Like [`send_query`](Self::send_query), returning
    /// [`EngineError::Cancelled`] as soon as `cancel` fires.
    ///
    /// Cancelling abandons the query; the engine keeps running.
    pub async fn send_query_with_cancel(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<Arc<Response>> {
        self.execute(query, Some(cancel)).await
    }

    async fn execute(
        &self,
        query: &Query,
        cancel: Option<&CancellationToken>,
    ) -> Result<Arc<Response>> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }

        let key = self.cache.key_for(query);
        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key) {
                self.metrics.cache_hit();
                debug!(key = %key, "Cache hit");
                return Ok(hit);
            }
            self.metrics.cache_miss();
        }

        let (slot, rx) = oneshot::channel();
        let (generation, n) = {
            let mut state = self.shared.state();
            if !state.running {
                return Err(EngineError::NotRunning);
            }
            if state.output_closed {
                return Err(EngineError::Transport(
                    "engine output closed".to_string(),
                ));
            }
            state.next_id += 1;
            let n = state.next_id;
            state.pending.insert(n, slot);
            (state.generation, n)
        };
        let id = protocol::query_id(n);

        // One deadline covers waiting for the writer, the write and the reply.
        let started = Instant::now();
        let timeout = self.config.query_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let exchange = async {
            let line = query.to_line(&id)?;
            self.shared.write_line(generation, &line).await?;
            debug!(id = %id, "Query sent");
            rx.await.map_err(|_| EngineError::Stopped)?
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout_at(deadline, exchange) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "Query timed out");
                    Err(EngineError::QueryTimeout { id: id.clone(), timeout })
                }
            },
            _ = cancelled => {
                debug!(id = %id, "Query cancelled");
                Err(EngineError::Cancelled)
            }
        };
        if outcome.is_err() {
            self.shared.abandon(generation, n);
        }

        let result = outcome.and_then(Response::into_result);
        self.metrics.query_completed(started.elapsed(), result.is_ok());

        let response = Arc::new(result?);
        if let Some(key) = key {
            self.cache.put(key, response.clone());
        }
        Ok(response)
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        if let Some(tasks) = state.tasks.take() {
            tasks.cancel();
        }
        for (_, slot) in state.pending.drain() {
            let _ = slot.send(Err(EngineError::Stopped));
        }
        // `kill_on_drop` reaps the child with the handle.
        state.child.take();
    }
}

#[async_trait]
impl Engine for ProcessController {
    async fn start(&self) -> Result<()> {
        ProcessController::start(self).await
    }

    async fn stop(&self) {
        ProcessController::stop(self).await
    }

    fn is_running(&self) -> bool {
        ProcessController::is_running(self)
    }

    async fn ping(&self) -> Result<()> {
        ProcessController::ping(self)
    }
}

async fn read_stdout(
    shared: Arc<Shared>,
    generation: u64,
    stdout: ChildStdout,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => shared.dispatch_line(generation, &line),
            Ok(None) => {
                debug!(generation, "Engine stdout closed");
                break;
            }
            Err(e) => {
                error!(generation, error = %e, "Failed to read engine stdout");
                break;
            }
        }
    }
    shared.output_closed(generation);
}

async fn read_stderr(stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(line = %line, "Engine stderr"),
                _ => return,
            },
        }
    }
}

async fn health_loop(
    shared: Arc<Shared>,
    metrics: Arc<dyn EngineMetrics>,
    generation: u64,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = shared.probe(generation, timeout) => result,
        };
        match result {
            Ok(()) => {
                debug!(generation, "Engine health probe passed");
                metrics.health_check(true);
            }
            Err(e) => {
                error!(generation, error = %e, "Engine health probe failed");
                metrics.health_check(false);
            }
        }
    }
}
