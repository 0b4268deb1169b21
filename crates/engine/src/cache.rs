//! Short-lived result cache keyed by `scheme://host:port`

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

use servprobe_common::MatchResult;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(180);

/// Expired entries are swept once every this many inserts.
pub const SWEEP_EVERY: usize = 256;

#[derive(Debug)]
struct CachedResult {
    result: MatchResult,
    stored_at: Instant,
}

/// Concurrent TTL cache of finished results.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<String, CachedResult>,
    ttl: Duration,
    inserts: AtomicUsize,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            inserts: AtomicUsize::new(0),
        }
    }

    /// A copy of the cached result, if one is still fresh.
    pub fn get(&self, key: &str) -> Option<MatchResult> {
        let hit = {
            let entry = self.entries.get(key)?;
            (entry.stored_at.elapsed() < self.ttl).then(|| entry.result.clone())
        };
        if hit.is_none() {
            self.entries.remove(key);
            trace!(key, "cache entry expired");
        }
        hit
    }

    /// Store `result`, sweeping expired entries every [`SWEEP_EVERY`] inserts
    /// so keys that are never looked up again do not pile up.
    pub fn insert(&self, key: impl Into<String>, result: MatchResult) {
        self.entries.insert(
            key.into(),
            CachedResult {
                result,
                stored_at: Instant::now(),
            },
        );
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        trace!(removed = before.saturating_sub(self.entries.len()), "cache swept");
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
