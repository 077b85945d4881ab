// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Correlation table of in-flight queries.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::protocol::Response;

/// Hand-off slot filled exactly once with the query outcome.
pub(crate) type Slot = oneshot::Sender<Result<Response>>;

/// In-flight queries keyed by their counter value.
///
/// Entries leave the table only through [`take`](Self::take) or
/// [`drain`](Self::drain); whoever removes an entry owns its slot.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u64, Slot>,
}

impl PendingTable {
    /// Register a slot. Returns false if `id` is already live.
    pub fn insert(&mut self, id: u64, slot: Slot) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, slot);
        true
    }

    /// Remove and return the slot for `id`.
    pub fn take(&mut self, id: u64) -> Option<Slot> {
        self.entries.remove(&id)
    }

    /// Remove every slot.
    pub fn drain(&mut self) -> Vec<(u64, Slot)> {
        self.entries.drain().collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn test_take_removes_once() {
        let mut table = PendingTable::default();
        let (tx, mut rx) = oneshot::channel();
        assert!(table.insert(1, tx));
        assert!(table.contains(1));

        let slot = table.take(1).unwrap();
        assert!(table.take(1).is_none());
        assert!(!table.contains(1));

        slot.send(Err(EngineError::Stopped)).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Err(EngineError::Stopped))));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = PendingTable::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(table.insert(7, tx1));
        assert!(!table.insert(7, tx2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = PendingTable::default();
        let mut receivers = Vec::new();
        for id in 0..5 {
            let (tx, rx) = oneshot::channel();
            table.insert(id, tx);
            receivers.push(rx);
        }

        let drained = table.drain();
        assert_eq!(drained.len(), 5);
        assert_eq!(table.len(), 0);

        for (_, slot) in drained {
            let _ = slot.send(Err(EngineError::Stopped));
        }
        for mut rx in receivers {
            assert!(matches!(rx.try_recv(), Ok(Err(EngineError::Stopped))));
        }
    }
}
