// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metrics sink injected into the controller and supervisor.
//!
//! Components report events through [`EngineMetrics`]; nothing is recorded
//! globally. [`EngineStats`] keeps atomic counters suitable for periodic
//! logging or for an exporter living outside this crate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Receiver of engine lifecycle and query events.
///
/// All methods default to no-ops so implementors only override what they need.
pub trait EngineMetrics: Send + Sync {
    /// The engine process started (`true`) or stopped (`false`).
    fn engine_status(&self, _running: bool) {}

    /// The supervisor restarted the engine.
    fn engine_restart(&self) {}

    /// A liveness or protocol health check finished.
    fn health_check(&self, _healthy: bool) {}

    /// A query dispatched to the engine finished.
    fn query_completed(&self, _duration: Duration, _success: bool) {}

    /// A query was answered from the cache.
    fn cache_hit(&self) {}

    /// A cacheable query missed the cache.
    fn cache_miss(&self) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl EngineMetrics for NoopMetrics {}

/// Atomic counters for every [`EngineMetrics`] event.
#[derive(Debug, Default)]
pub struct EngineStats {
    running: AtomicBool,
    starts: AtomicU64,
    stops: AtomicU64,
    restarts: AtomicU64,
    health_ok: AtomicU64,
    health_failed: AtomicU64,
    queries_ok: AtomicU64,
    queries_failed: AtomicU64,
    query_micros_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Last reported engine status.
    pub running: bool,
    /// Number of process starts.
    pub starts: u64,
    /// Number of process stops.
    pub stops: u64,
    /// Number of supervisor restarts.
    pub restarts: u64,
    /// Passed health checks.
    pub health_ok: u64,
    /// Failed health checks.
    pub health_failed: u64,
    /// Queries answered successfully by the engine.
    pub queries_ok: u64,
    /// Queries that failed, timed out or were cancelled.
    pub queries_failed: u64,
    /// Mean engine round-trip in milliseconds.
    pub mean_query_ms: f64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
}

impl EngineStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let queries_ok = self.queries_ok.load(Ordering::Relaxed);
        let queries_failed = self.queries_failed.load(Ordering::Relaxed);
        let total = queries_ok + queries_failed;
        let micros = self.query_micros_total.load(Ordering::Relaxed);

        EngineStatsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            starts: self.starts.load(Ordering::Relaxed),
            stops: self.stops.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            health_ok: self.health_ok.load(Ordering::Relaxed),
            health_failed: self.health_failed.load(Ordering::Relaxed),
            queries_ok,
            queries_failed,
            mean_query_ms: if total == 0 {
                0.0
            } else {
                micros as f64 / total as f64 / 1000.0
            },
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

impl EngineMetrics for EngineStats {
    fn engine_status(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
        if running {
            self.starts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn engine_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn health_check(&self, healthy: bool) {
        let counter = if healthy {
            &self.health_ok
        } else {
            &self.health_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn query_completed(&self, duration: Duration, success: bool) {
        let counter = if success {
            &self.queries_ok
        } else {
            &self.queries_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.query_micros_total
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }
}
