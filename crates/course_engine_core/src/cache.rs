//! crates/course_engine_core/src/cache.rs
//!
//! Process-wide TTL store of speculatively generated units.
//!
//! Entries are opportunistic: a miss is never an error. `take` removes the
//! entry it returns, so of two concurrent readers for the same key exactly one
//! gets the payload and the other falls through to live generation. Expiry is
//! checked on read as well as by the periodic sweep, so an expired entry is
//! never handed out even if the sweep has not run yet.

use crate::parser::Unit;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Identifies one speculative unit of one course.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(course_id: Uuid, unit: &str) -> Self {
        Self(format!("{}:{}", course_id, unit))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    unit: Unit,
    created_at: Instant,
}

/// Cloning shares the underlying map.
#[derive(Clone)]
pub struct PregenerationCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl PregenerationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= self.ttl
    }

    /// Inserts or replaces the entry for `key`.
    pub fn put(&self, key: CacheKey, unit: Unit) {
        debug!(key = key.as_str(), "Caching pregenerated unit");
        self.entries.insert(
            key,
            CacheEntry {
                unit,
                created_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the entry for `key` if it is still fresh.
    pub fn take(&self, key: &CacheKey) -> Option<Unit> {
        let (_, entry) = self.entries.remove(key)?;
        if self.is_expired(&entry, Instant::now()) {
            debug!(key = key.as_str(), "Discarding expired pregenerated unit");
            return None;
        }
        Some(entry.unit)
    }

    /// Whether a fresh entry exists, without consuming it.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|entry| !self.is_expired(&entry, now))
            .unwrap_or(false)
    }

    /// Number of fresh entries.
    pub fn size(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !self.is_expired(entry.value(), now))
            .count()
    }

    /// Drops every expired entry and reports how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now.duration_since(entry.created_at) < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Runs `sweep` every `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Pregeneration cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        if evicted > 0 {
                            info!(evicted, remaining = cache.entries.len(), "Swept expired pregenerated units");
                        }
                    }
                }
            }
        })
    }
}

impl Default for PregenerationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
