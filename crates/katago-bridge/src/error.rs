// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for katago-bridge.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by engine lifecycle and query operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// `start()` was called on an engine that is already running.
    #[error("Engine is already running")]
    AlreadyRunning,

    /// A query or probe was issued while the engine is not running.
    #[error("Engine is not running")]
    NotRunning,

    /// No response arrived within the query window.
    #[error("Query {id} timed out after {}ms", timeout.as_millis())]
    QueryTimeout {
        /// Correlation ID of the abandoned query.
        id: String,
        /// The window that elapsed.
        timeout: Duration,
    },

    /// The engine answered the query with an error payload.
    #[error("Engine error{}: {message}", code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
    Process {
        /// Optional machine-readable code from a structured error.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },

    /// Writing to the engine failed or its output closed unexpectedly.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine was stopped while the query was in flight.
    #[error("Engine stopped")]
    Stopped,

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// The engine process could not be spawned.
    #[error("Failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    /// The engine process failed a liveness check.
    #[error("Engine unhealthy: {0}")]
    ProcessUnhealthy(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns true for errors that indicate the query outcome is unknown
    /// because the process, not the query, failed.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Stopped)
    }
}

/// Result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
