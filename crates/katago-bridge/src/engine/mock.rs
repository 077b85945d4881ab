// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock engine for testing.
//!
//! An [`Engine`] that tracks lifecycle calls without spawning a process.
//! Failures are scripted through flags so supervisor behaviour can be
//! exercised deterministically.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::Engine;
use crate::error::{EngineError, Result};

/// Mock engine for testing.
#[derive(Debug, Default)]
pub struct MockEngine {
    running: AtomicBool,
    start_calls: AtomicU64,
    stop_calls: AtomicU64,
    ping_calls: AtomicU64,
    /// Number of upcoming `start()` calls that fail.
    fail_starts: AtomicU32,
    /// If true, every `ping()` fails.
    fail_ping: AtomicBool,
    /// If set, `ping()` sleeps this long in milliseconds before answering.
    ping_delay_ms: AtomicU64,
}

impl MockEngine {
    /// Create a healthy mock engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock engine whose next `n` starts fail.
    pub fn failing_starts(n: u32) -> Self {
        let engine = Self::new();
        engine.fail_starts.store(n, Ordering::SeqCst);
        engine
    }

    /// Make the next `n` starts fail.
    pub fn fail_next_starts(&self, n: u32) {
        self.fail_starts.store(n, Ordering::SeqCst);
    }

    /// Toggle ping failures.
    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Delay every ping, to simulate a hung process.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Simulate the process dying underneath its controller.
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Number of `start()` calls, failed ones included.
    pub fn start_count(&self) -> u64 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of `stop()` calls.
    pub fn stop_count(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of `ping()` calls.
    pub fn ping_count(&self) -> u64 {
        self.ping_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let remaining = self.fail_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock start failure",
            )));
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<()> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(EngineError::ProcessUnhealthy("mock ping failure".to_string()));
        }
        Ok(())
    }

    fn engine_type(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let engine = MockEngine::new();
        assert!(!engine.is_running());
        assert!(matches!(engine.ping().await, Err(EngineError::NotRunning)));

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start().await,
            Err(EngineError::AlreadyRunning)
        ));
        engine.ping().await.unwrap();

        engine.crash();
        assert!(!engine.is_running());

        engine.stop().await;
        assert_eq!(engine.start_count(), 2);
        assert_eq!(engine.stop_count(), 1);
        assert_eq!(engine.ping_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let engine = MockEngine::failing_starts(2);
        assert!(engine.start().await.is_err());
        assert!(engine.start().await.is_err());
        engine.start().await.unwrap();

        engine.set_fail_ping(true);
        assert!(matches!(
            engine.ping().await,
            Err(EngineError::ProcessUnhealthy(_))
        ));
    }
}
