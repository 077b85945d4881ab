// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cache keys derived from the position-defining fields of a query.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::protocol::Query;

/// Fields that participate in the fingerprint by default.
///
/// Per-call budgets (`maxVisits`, `overrideSettings`, `priority`,
/// `reportDuringSearchEvery`) are left out so the same position analysed
/// under a different budget maps to the same entry.
pub const DEFAULT_FINGERPRINT_FIELDS: &[&str] = &[
    "rules",
    "komi",
    "boardXSize",
    "boardYSize",
    "initialStones",
    "initialPlayer",
    "moves",
    "analyzeTurns",
    "includeOwnership",
    "includePolicy",
    "avoidMoves",
    "allowMoves",
];

/// Computes SHA-256 fingerprints over a configured field subset.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    fields: Vec<String>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_FINGERPRINT_FIELDS.iter().map(|s| s.to_string()))
    }
}

impl Fingerprinter {
    /// Fingerprint over the given field names.
    pub fn new(fields: impl IntoIterator<Item = String>) -> Self {
        let mut fields: Vec<String> = fields.into_iter().collect();
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    /// Participating field names, sorted.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Hex-encoded fingerprint, or `None` if the query has none of the fields.
    pub fn fingerprint(&self, query: &Query) -> Option<String> {
        let mut selected = Map::new();
        for name in &self.fields {
            if let Some(value) = query.get(name) {
                selected.insert(name.clone(), canonicalize(value));
            }
        }
        if selected.is_empty() {
            return None;
        }

        let bytes = serde_json::to_vec(&Value::Object(selected)).ok()?;
        Some(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Rebuild objects with sorted keys so encoding is independent of map ordering.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
