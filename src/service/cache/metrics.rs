use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{de::DeserializeOwned, Serialize};

use super::types::CacheEntry;

/// Lookup counters for one cache. Negative hits are kept apart so that
/// probing with unknown keys is visible next to the regular hit rate.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub errors: u64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup<T>(&self, entry: Option<&CacheEntry<T>>)
    where
        T: Clone + Serialize + DeserializeOwned,
    {
        let counter = match entry {
            Some(CacheEntry::Positive(_)) => &self.hits,
            Some(CacheEntry::Negative) => &self.negative_hits,
            None => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl CacheMetricsSnapshot {
    pub fn lookups(&self) -> u64 {
        self.hits + self.negative_hits + self.misses
    }

    /// Share of lookups answered without the store, negative hits included.
    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            n => (self.hits + self.negative_hits) as f64 / n as f64,
        }
    }
}

impl fmt::Display for CacheMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lookups={} hit_rate={:.1}% negative={} writes={} invalidations={} errors={}",
            self.lookups(),
            self.hit_rate() * 100.0,
            self.negative_hits,
            self.writes,
            self.invalidations,
            self.errors
        )
    }
}
