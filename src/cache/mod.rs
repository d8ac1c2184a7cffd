//! Bounded, time-aware cache of DNS responses keyed by lowercase domain.
//!
//! Staleness never removes an entry; only capacity pressure (least recently
//! used first) and [`ResponseCache::clear`] do.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: usize = 500;
pub const DEFAULT_TTL: Duration = Duration::from_millis(300_000);
/// Recency queue may hold this many stale markers per live entry before it
/// is compacted.
const ORDER_SLACK: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub domain: String,
    /// DNS payload as it was first answered (original transaction id).
    pub response: Vec<u8>,
    pub created_at: Instant,
    pub blocked: bool,
}

impl CacheEntry {
    pub fn new(domain: impl Into<String>, response: Vec<u8>, blocked: bool) -> Self {
        Self {
            domain: domain.into(),
            response,
            created_at: Instant::now(),
            blocked,
        }
    }

    /// Fresh while younger than `ttl`.
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) < ttl
    }
}

struct Slot {
    entry: CacheEntry,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    slots: FxHashMap<String, Slot>,
    /// (tick, key) in touch order; a marker is live only if its tick matches
    /// the slot's `last_used`.
    order: VecDeque<(u64, String)>,
    tick: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.last_used = tick;
            self.order.push_back((tick, key.to_string()));
        }
    }

    fn evict_lru(&mut self) -> Option<String> {
        while let Some((tick, key)) = self.order.pop_front() {
            let live = self
                .slots
                .get(&key)
                .is_some_and(|slot| slot.last_used == tick);
            if live {
                self.slots.remove(&key);
                return Some(key);
            }
        }
        None
    }

    fn compact(&mut self, capacity: usize) {
        if self.order.len() <= capacity.saturating_mul(ORDER_SLACK) {
            return;
        }
        let slots = &self.slots;
        self.order.retain(|(tick, key)| {
            slots
                .get(key)
                .is_some_and(|slot| slot.last_used == *tick)
        });
    }
}

pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, domain: &str) -> Option<CacheEntry> {
        self.get_at(domain, Instant::now())
    }

    /// Lookup as of `now`. A fresh hit counts as a use for LRU purposes; a
    /// stale entry is reported as a miss and left in place.
    pub fn get_at(&self, domain: &str, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let entry = {
            let slot = inner.slots.get(domain)?;
            if !slot.entry.is_fresh(now, self.ttl) {
                return None;
            }
            slot.entry.clone()
        };
        inner.touch(domain);
        inner.compact(self.capacity);
        Some(entry)
    }

    /// Inserts or replaces the entry for `entry.domain`. Returns the domain
    /// evicted to make room, if any.
    pub fn put(&self, entry: CacheEntry) -> Option<String> {
        let mut inner = self.inner.lock();
        let key = entry.domain.clone();
        let evicted = if !inner.slots.contains_key(&key) && inner.slots.len() >= self.capacity {
            inner.evict_lru()
        } else {
            None
        };
        inner.slots.insert(
            key.clone(),
            Slot {
                entry,
                last_used: 0,
            },
        );
        inner.touch(&key);
        inner.compact(self.capacity);
        evicted
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
