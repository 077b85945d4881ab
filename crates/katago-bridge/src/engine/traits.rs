// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle seam between the supervisor and an engine implementation.

use async_trait::async_trait;

use crate::error::Result;

/// Lifecycle operations the supervisor drives.
///
/// [`ProcessController`](super::ProcessController) is the production
/// implementation; [`MockEngine`](super::MockEngine) scripts failures for tests.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Launch the engine. Fails with `AlreadyRunning` if it is up.
    async fn start(&self) -> Result<()>;

    /// Shut the engine down. Never fails; no-op when not running.
    async fn stop(&self);

    /// Current running flag.
    fn is_running(&self) -> bool;

    /// OS-level liveness check. Fails with `NotRunning` when stopped.
    async fn ping(&self) -> Result<()>;

    /// Short name used in logs.
    fn engine_type(&self) -> &'static str {
        "process"
    }
}
