//! Per-element cache of load-combination breakdowns
//!
//! Entries are filled lazily on first view and dropped whenever the element
//! is re-analysed, because the governing combination set can change after a
//! reinforcement edit. Fetches that were started before an invalidation carry
//! a stale [`CacheTicket`] and are refused on insert.

use std::collections::HashMap;
use tracing::debug;

use crate::types::{CombinationRow, ElementKey};

/// Statistics about cache usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Elements with cached rows
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Snapshot of an element's cache generation taken before a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    epoch: u64,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct CombinationDetailCache {
    entries: HashMap<ElementKey, Vec<CombinationRow>>,
    generations: HashMap<ElementKey, u64>,
    /// Bumped by `clear`, so tickets from a previous dataset never match
    epoch: u64,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

impl CombinationDetailCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached rows for `key`, counting the lookup as a hit or miss
    pub fn get(&mut self, key: &ElementKey) -> Option<Vec<CombinationRow>> {
        match self.entries.get(key) {
            Some(rows) => {
                self.hits += 1;
                Some(rows.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Cached rows without touching statistics
    pub fn peek(&self, key: &ElementKey) -> Option<&[CombinationRow]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &ElementKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn ticket(&self, key: &ElementKey) -> CacheTicket {
        CacheTicket {
            epoch: self.epoch,
            generation: self.generations.get(key).copied().unwrap_or(0),
        }
    }

    /// Store rows fetched under `ticket`; refused if `key` was invalidated since
    pub fn insert(&mut self, key: ElementKey, ticket: CacheTicket, rows: Vec<CombinationRow>) -> bool {
        if self.ticket(&key) != ticket {
            debug!("Discarding combination rows for {}: element re-analysed during fetch", key);
            return false;
        }
        self.entries.insert(key, rows);
        true
    }

    /// Drop the entry for `key` and retire any ticket issued for it
    pub fn invalidate(&mut self, key: &ElementKey) -> bool {
        *self.generations.entry(key.clone()).or_insert(0) += 1;
        self.invalidations += 1;
        self.entries.remove(key).is_some()
    }

    /// Drop everything, e.g. on dataset reload
    pub fn clear(&mut self) {
        self.entries.clear();
        self.generations.clear();
        self.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            invalidations: self.invalidations,
        }
    }
}
