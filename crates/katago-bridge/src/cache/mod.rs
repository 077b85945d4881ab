// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result cache shared between the process controller and its callers.
//!
//! [`ResultCache`] pairs a [`Fingerprinter`] with an [`LruCache`] of
//! completed responses behind a single lock. A disabled cache fingerprints
//! nothing and stores nothing, so callers never special-case it.

mod fingerprint;
mod lru;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use fingerprint::{DEFAULT_FINGERPRINT_FIELDS, Fingerprinter};
pub use lru::{CacheStats, LruCache};

use crate::config::CacheConfig;
use crate::protocol::{Query, Response};

/// Thread-safe cache of engine responses keyed by query fingerprint.
#[derive(Debug)]
pub struct ResultCache {
    enabled: bool,
    fingerprinter: Fingerprinter,
    entries: Mutex<LruCache<Arc<Response>>>,
}

impl ResultCache {
    /// Build a cache from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            fingerprinter: Fingerprinter::new(config.fingerprint_fields.iter().cloned()),
            entries: Mutex::new(
                LruCache::new(config.max_items, config.max_size_bytes).with_ttl(config.ttl()),
            ),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(&CacheConfig::disabled())
    }

    /// Whether results are cached.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cache key for `query`, or `None` if disabled or the query has no
    /// position-defining fields.
    pub fn key_for(&self, query: &Query) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.fingerprinter.fingerprint(query)
    }

    /// Look up a stored response.
    pub fn get(&self, key: &str) -> Option<Arc<Response>> {
        if !self.enabled {
            return None;
        }
        self.lock().get(key).cloned()
    }

    /// Store a response, sized by its serialized length.
    pub fn put(&self, key: impl Into<String>, response: Arc<Response>) {
        if !self.enabled {
            return;
        }
        let size = response.estimated_size();
        self.lock().put(key, response, size);
    }

    /// Drop one entry.
    pub fn remove(&self, key: &str) -> Option<Arc<Response>> {
        self.lock().remove(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    /// Zero the counters.
    pub fn reset_stats(&self) {
        self.lock().reset_stats();
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Arc<Response>>> {
        // Every mutation leaves the list consistent before it can panic.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
