// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded least-recently-used store.
//!
//! Entries live in a slot arena linked into a doubly-linked recency list
//! (head = most recent, tail = least recent). The map only stores slot
//! indices, so promotion and eviction are O(1).
//!
//! Two ceilings apply after every insert: item count and total declared size.
//! A single entry larger than the size ceiling is kept when it is the only
//! entry left.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counters and occupancy reported by [`LruCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Current number of entries.
    pub items: usize,
    /// Current total declared size in bytes.
    pub size: usize,
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries removed to satisfy a ceiling.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// `hits / (hits + misses)`, or 0 with no lookups.
    pub hit_rate: f64,
}

#[derive(Debug)]
struct Node<V> {
    key: String,
    value: V,
    size: usize,
    inserted_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU cache with item, size and age limits.
#[derive(Debug)]
pub struct LruCache<V> {
    index: HashMap<String, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    max_items: usize,
    max_size: usize,
    ttl: Option<Duration>,
    size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> LruCache<V> {
    /// Create a cache. A zero `max_items` or `max_size` disables that ceiling.
    pub fn new(max_items: usize, max_size: usize) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_items,
            max_size,
            ttl: None,
            size: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    /// Expire entries older than `ttl` on lookup.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl.filter(|t| !t.is_zero());
        self
    }

    /// Look up `key`, promoting it on hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        let Some(&idx) = self.index.get(key) else {
            self.misses += 1;
            return None;
        };

        if self.is_expired(idx) {
            self.remove_slot(idx);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.detach(idx);
        self.push_front(idx);
        self.slots[idx].as_ref().map(|n| &n.value)
    }

    /// True if `key` is present and unexpired. Does not touch recency or counters.
    pub fn contains_key(&self, key: &str) -> bool {
        self.index
            .get(key)
            .is_some_and(|&idx| !self.is_expired(idx))
    }

    /// Insert or replace `key`, then evict until both ceilings hold.
    pub fn put(&mut self, key: impl Into<String>, value: V, size: usize) {
        let key = key.into();
        let now = Instant::now();

        if let Some(&idx) = self.index.get(&key) {
            if let Some(node) = self.slots[idx].as_mut() {
                self.size = self.size - node.size + size;
                node.value = value;
                node.size = size;
                node.inserted_at = now;
            }
            self.detach(idx);
            self.push_front(idx);
        } else {
            let node = Node {
                key: key.clone(),
                value,
                size,
                inserted_at: now,
                prev: None,
                next: None,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    self.slots[idx] = Some(node);
                    idx
                }
                None => {
                    self.slots.push(Some(node));
                    self.slots.len() - 1
                }
            };
            self.index.insert(key, idx);
            self.size += size;
            self.push_front(idx);
        }

        self.evict();
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = self.index.get(key).copied()?;
        self.remove_slot(idx)
    }

    /// Remove every entry. Counters are kept.
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.size = 0;
    }

    /// Number of entries, expired ones included until they are looked up.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total declared size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Snapshot of counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            items: self.len(),
            size: self.size,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }

    /// Zero the hit, miss, eviction and expiration counters.
    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.expirations = 0;
    }

    fn over_limit(&self) -> bool {
        let len = self.len();
        (self.max_items > 0 && len > self.max_items)
            || (self.max_size > 0 && self.size > self.max_size && len > 1)
    }

    fn evict(&mut self) {
        while self.over_limit() {
            let Some(tail) = self.tail else { break };
            self.remove_slot(tail);
            self.evictions += 1;
        }
    }

    fn is_expired(&self, idx: usize) -> bool {
        match (self.ttl, self.slots[idx].as_ref()) {
            (Some(ttl), Some(node)) => node.inserted_at.elapsed() > ttl,
            _ => false,
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Option<V> {
        self.detach(idx);
        let node = self.slots[idx].take()?;
        self.index.remove(&node.key);
        self.size -= node.size;
        self.free.push(idx);
        Some(node.value)
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_mut() {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None if self.head == Some(idx) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None if self.tail == Some(idx) => self.tail = prev,
            None => {}
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(node) = self.slots[h].as_mut()
        {
            node.prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}
