//! # umbra DNS answer cache
//!
//! Per-network cache mapping (name, type, class) to stored answer bytes,
//! with the concurrency behavior the dispatcher depends on:
//!
//! - **Coalescing**: the first lookup that misses installs a pending
//!   marker and is told to fetch; concurrent lookups for the same key
//!   attach as waiters instead of launching parallel upstream queries.
//! - **Flush wakes waiters**: flushing drops every entry *and* every
//!   pending marker, waking waiters so they re-enter the lookup and
//!   trigger a fresh upstream request.
//! - **Generation gating**: a fetch that completes after a flush still
//!   answers its own caller but does not repopulate the cache.
//!
//! One `ResponseCache` instance serves exactly one network; isolation
//! between networks falls out of the resolver holding one per netid.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::trace;

pub mod entry;
pub mod key;

pub use entry::CacheEntry;
pub use key::CacheKey;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of stored entries.
    pub max_entries: usize,

    /// Ceiling applied to every positive TTL.
    pub max_ttl: Duration,

    /// Ceiling applied to negative TTLs (on top of the SOA minimum).
    pub negative_ttl_cap: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            max_ttl: Duration::from_secs(86_400),
            negative_ttl_cap: Duration::from_secs(900),
        }
    }
}

/// Result of a cache lookup.
pub enum CacheLookup {
    /// A live entry; bytes already carry the caller's ID and aged TTLs.
    Hit(Vec<u8>),

    /// Nothing cached and nobody fetching: the caller must fetch and
    /// report back through the guard.
    Miss(QueryGuard),

    /// Another query for the same key is in flight; wait, then look up
    /// again.
    Wait(WaitHandle),
}

struct Pending {
    generation: u64,
    tx: watch::Sender<()>,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    pending: Option<Pending>,
}

/// Cache counters, updated relaxed.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    flushes: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

/// Single-network DNS answer cache.
pub struct ResponseCache {
    config: CacheConfig,
    slots: DashMap<CacheKey, Slot>,
    generation: AtomicU64,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            slots: DashMap::new(),
            generation: AtomicU64::new(0),
            stats: CacheStats::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clamps a TTL per policy.
    pub fn clamp_ttl(&self, ttl: Duration, negative: bool) -> Duration {
        if negative {
            ttl.min(self.config.negative_ttl_cap)
        } else {
            ttl.min(self.config.max_ttl)
        }
    }

    /// Looks up `key`. On a miss the returned guard owns the pending
    /// marker for this key; dropping it without completing wakes any
    /// waiters so one of them can take over the fetch.
    pub fn lookup(self: &Arc<Self>, key: &CacheKey, query_id: u16) -> CacheLookup {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.clone()).or_default();

        if let Some(entry) = &slot.entry {
            if !entry.is_expired(now) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return CacheLookup::Hit(entry.answer_for(query_id, now));
            }
        }

        if let Some(pending) = &slot.pending {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Wait(WaitHandle {
                rx: pending.tx.subscribe(),
            });
        }

        let (tx, _rx) = watch::channel(());
        let generation = self.generation.load(Ordering::Acquire);
        slot.pending = Some(Pending { generation, tx });
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Miss(QueryGuard {
            cache: Arc::clone(self),
            key: key.clone(),
            generation,
            done: false,
        })
    }

    /// Peeks at the stored entry without installing a pending marker.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.slots.get(key)?;
        slot.entry.clone()
    }

    /// Stores `entry`, replacing an existing one only if it is newer.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) {
        self.maybe_evict();
        let mut slot = self.slots.entry(key).or_default();
        match &slot.entry {
            Some(old) if old.created_at() > entry.created_at() => {}
            _ => slot.entry = Some(entry),
        }
    }

    /// Drops every entry and wakes every pending waiter.
    pub fn flush(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<CacheKey> = self.slots.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                if let Some(pending) = slot.pending {
                    // Receivers observe either the send or the sender
                    // dropping right after; both wake them.
                    let _ = pending.tx.send(());
                }
            }
        }
        trace!("cache flushed");
    }

    fn maybe_evict(&self) {
        if self.slots.len() < self.config.max_entries {
            return;
        }
        let now = Instant::now();
        let mut oldest: Option<(CacheKey, Instant)> = None;
        let mut expired = Vec::new();
        for slot in self.slots.iter().take(64) {
            if slot.pending.is_some() {
                continue;
            }
            match &slot.entry {
                Some(e) if e.is_expired(now) => expired.push(slot.key().clone()),
                Some(e) => {
                    let exp = e.created_at() + e.remaining_ttl(now);
                    if oldest.as_ref().map_or(true, |(_, t)| exp < *t) {
                        oldest = Some((slot.key().clone(), exp));
                    }
                }
                None => expired.push(slot.key().clone()),
            }
        }
        if expired.is_empty() {
            if let Some((key, _)) = oldest {
                self.slots.remove(&key);
            }
        } else {
            for key in expired {
                self.slots.remove_if(&key, |_, slot| slot.pending.is_none());
            }
        }
    }

    fn finish(&self, key: &CacheKey, generation: u64, entry: Option<CacheEntry>) {
        let current = self.generation.load(Ordering::Acquire);
        let mut remove = false;
        if let Some(mut slot) = self.slots.get_mut(key) {
            let ours = slot
                .pending
                .as_ref()
                .map_or(false, |p| p.generation == generation);
            if ours {
                if let Some(pending) = slot.pending.take() {
                    let _ = pending.tx.send(());
                }
            }
            if generation == current {
                if let Some(entry) = entry {
                    slot.entry = Some(entry);
                }
            }
            remove = slot.entry.is_none() && slot.pending.is_none();
        }
        if remove {
            self.slots.remove_if(key, |_, slot| {
                slot.entry.is_none() && slot.pending.is_none()
            });
        }
    }
}

/// Owned by the single fetcher for a key while its query is in flight.
pub struct QueryGuard {
    cache: Arc<ResponseCache>,
    key: CacheKey,
    generation: u64,
    done: bool,
}

impl QueryGuard {
    /// Stores the fetched answer (unless a flush intervened) and wakes
    /// waiters.
    pub fn complete(mut self, entry: CacheEntry) {
        self.done = true;
        self.cache.finish(&self.key, self.generation, Some(entry));
    }

    /// Wakes waiters without storing anything, e.g. on upstream failure
    /// or when the query asked not to cache.
    pub fn abandon(mut self) {
        self.done = true;
        self.cache.finish(&self.key, self.generation, None);
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        if !self.done {
            self.cache.finish(&self.key, self.generation, None);
        }
    }
}

/// Handle held by coalesced queries while the fetcher works.
pub struct WaitHandle {
    rx: watch::Receiver<()>,
}

impl WaitHandle {
    /// Waits until the in-flight query settles (or the cache is
    /// flushed); the caller then repeats its lookup.
    pub async fn wait(mut self) {
        let _ = self.rx.changed().await;
    }
}
