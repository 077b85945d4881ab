// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine process management.
//!
//! - [`Engine`]: lifecycle trait driven by the supervisor
//! - [`ProcessController`]: spawns the engine and correlates queries
//! - [`MockEngine`]: scripted implementation for tests

mod mock;
mod pending;
mod process;
mod traits;

pub use mock::MockEngine;
pub use process::ProcessController;
pub use traits::Engine;
