// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! KataGo Bridge - Supervised Engine Access
//!
//! This crate fronts a KataGo analysis engine (or any binary speaking the
//! same line-delimited JSON protocol) with a supervised, cached,
//! concurrency-safe request/response bridge. All analysis happens in the
//! external process; payloads are opaque JSON to this crate.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Callers (tool handlers, CLI)                  │
//! └──────────────────────────────────────────────────────────────┘
//!          │ send_query                          │ start/stop/restart
//!          ▼                                     ▼
//! ┌──────────────────────┐  Engine trait  ┌──────────────────────┐
//! │  ProcessController   │◄───────────────│      Supervisor      │
//! │  ┌────────────────┐  │                │  probe + restart     │
//! │  │ pending table  │  │                │  via RetryExecutor   │
//! │  └────────────────┘  │                └──────────────────────┘
//! │          │           │
//! │   ┌──────┴──────┐    │───────► ResultCache (LRU, fingerprint keys)
//! │   │ stdin │stdout│   │
//! └───┴──────┬──────┴────┘
//!            ▼
//! ┌──────────────────────┐
//! │   katago analysis    │
//! └──────────────────────┘
//! ```
//!
//! # Query Flow
//!
//! 1. The query's fingerprint is looked up in the [`cache::ResultCache`].
//! 2. On a miss the controller assigns the next ID (`q1`, `q2`, ...),
//!    registers a pending entry and writes one JSON line to stdin.
//! 3. The stdout reader decodes each line and completes the pending entry
//!    with the matching ID.
//! 4. The caller wakes with the response, an engine error, a timeout, or
//!    [`error::EngineError::Stopped`] if the engine was stopped meanwhile.
//! 5. Successful responses are stored in the cache.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `KATAGO_BINARY_PATH` | `katago` | Engine binary |
//! | `KATAGO_MODEL_PATH` | - | Model file (`-model`) |
//! | `KATAGO_CONFIG_PATH` | - | Analysis config (`-config`) |
//! | `KATAGO_MAX_TIME` | `10.0` | Seconds per query; timeout is twice this |
//! | `KATAGO_BRIDGE_CACHE_ENABLED` | `true` | Enable the result cache |
//! | `KATAGO_BRIDGE_CACHE_MAX_ITEMS` | `1000` | Cache item ceiling |
//! | `KATAGO_BRIDGE_CACHE_MAX_BYTES` | `104857600` | Cache size ceiling |
//! | `KATAGO_BRIDGE_CACHE_TTL_SECS` | `3600` | Cache entry lifetime |
//! | `KATAGO_BRIDGE_PROBE_INTERVAL_MS` | `30000` | Supervisor probe interval |
//! | `KATAGO_BRIDGE_CONFIG` | - | JSON config file |
//!
//! # Modules
//!
//! - [`cache`]: LRU result cache and query fingerprints
//! - [`config`]: Configuration from JSON files and environment variables
//! - [`engine`]: Engine trait, process controller, and mock engine
//! - [`error`]: Error types
//! - [`metrics`]: Injected metrics sink
//! - [`protocol`]: Wire messages
//! - [`retry`]: Backoff executor
//! - [`supervisor`]: Start, probe, and restart policy

#![deny(missing_docs)]

/// LRU result cache keyed by query fingerprint.
pub mod cache;

/// Configuration from JSON files and environment variables.
pub mod config;

/// Engine lifecycle trait and process controller.
pub mod engine;

/// Error types for engine operations.
pub mod error;

/// Metrics sink injected into the controller and supervisor.
pub mod metrics;

/// Line-delimited JSON messages.
pub mod protocol;

/// Capped exponential backoff with jitter.
pub mod retry;

/// Engine supervision.
pub mod supervisor;

pub use cache::ResultCache;
pub use config::Config;
pub use engine::{Engine, MockEngine, ProcessController};
pub use error::{EngineError, Result};
pub use metrics::{EngineMetrics, EngineStats, NoopMetrics};
pub use protocol::{Query, Response, ResponseError};
pub use retry::{RetryConfig, RetryExecutor};
pub use supervisor::{Supervisor, SupervisorState};
