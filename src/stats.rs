//! Engine-lifetime counters surfaced to the host as blocking statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ffi::ShieldStats;

#[derive(Default)]
pub struct ProxyStats {
    queries: AtomicU64,
    blocked: AtomicU64,
    cache_hits: AtomicU64,
    forwarded: AtomicU64,
    upstream_failures: AtomicU64,
    dropped_packets: AtomicU64,
    forward_saturated: AtomicU64,
    write_failures: AtomicU64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saturated(&self) {
        self.forward_saturated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values; `cache_entries` and `state` are filled in by the caller.
    pub fn snapshot(&self) -> ShieldStats {
        ShieldStats {
            queries: self.queries.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            forward_saturated: self.forward_saturated.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            cache_entries: 0,
            state: 0,
        }
    }
}
