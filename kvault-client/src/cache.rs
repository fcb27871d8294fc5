//! Read cache with broadcast invalidation.
//!
//! Entries live until invalidated; there is no size bound and no staleness
//! check beyond invalidation. Absent keys are cached too (`None`), so a
//! repeated read of a missing key costs no round trip.
//!
//! A `get` response may arrive after a broadcast that already invalidated
//! its key. Reads therefore take a [`ReadTicket`] before the request goes
//! out, and [`ReadCache::finish_read`] only stores the value if the key's
//! generation has not moved since.

use std::collections::HashMap;

use serde_json::Value;

/// Counters exposed through `ClientProxy::cache_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub invalidations: u64,
}

/// Marks a read in flight for `key`.
#[derive(Debug)]
pub struct ReadTicket {
    key: String,
    generation: u64,
}

#[derive(Debug)]
struct InflightRead {
    generation: u64,
    readers: usize,
}

#[derive(Debug, Default)]
pub struct ReadCache {
    entries: HashMap<String, Option<Value>>,
    inflight: HashMap<String, InflightRead>,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(value)` on a hit, where `value` may itself be `None` for a
    /// cached absent key.
    pub fn lookup(&mut self, key: &str) -> Option<Option<Value>> {
        match self.entries.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn begin_read(&mut self, key: &str) -> ReadTicket {
        let inflight = self
            .inflight
            .entry(key.to_string())
            .or_insert(InflightRead {
                generation: 0,
                readers: 0,
            });
        inflight.readers += 1;
        ReadTicket {
            key: key.to_string(),
            generation: inflight.generation,
        }
    }

    /// Store the result of a read unless `ticket.key` was invalidated while
    /// the read was outstanding. Returns whether the value was stored.
    pub fn finish_read(&mut self, ticket: ReadTicket, value: Option<Value>) -> bool {
        let current = self.release(&ticket);
        if current != Some(ticket.generation) {
            return false;
        }
        self.entries.insert(ticket.key, value);
        true
    }

    /// End a read that produced nothing cacheable.
    pub fn abandon(&mut self, ticket: ReadTicket) {
        self.release(&ticket);
    }

    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(inflight) = self.inflight.get_mut(key) {
            inflight.generation += 1;
        }
        self.invalidations += 1;
    }

    /// Drop every entry and every in-flight read's claim to populate.
    pub fn clear(&mut self) {
        self.entries.clear();
        for inflight in self.inflight.values_mut() {
            inflight.generation += 1;
        }
        self.invalidations += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
            invalidations: self.invalidations,
        }
    }

    /// Drop one reader; return the key's generation as of release.
    fn release(&mut self, ticket: &ReadTicket) -> Option<u64> {
        let inflight = self.inflight.get_mut(&ticket.key)?;
        let generation = inflight.generation;
        inflight.readers = inflight.readers.saturating_sub(1);
        if inflight.readers == 0 {
            self.inflight.remove(&ticket.key);
        }
        Some(generation)
    }
}
