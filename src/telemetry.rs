use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::filter::BlockReason;
use crate::logger::{self, BreadcrumbFlags};

const MAX_EVENTS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockSource {
    Filter(BlockReason),
    Cached,
}

impl BlockSource {
    pub fn code(self) -> u8 {
        match self {
            Self::Filter(BlockReason::Exact) => 0,
            Self::Filter(BlockReason::Ancestor) => 1,
            Self::Filter(BlockReason::Keyword) => 2,
            Self::Filter(BlockReason::Rule) => 3,
            Self::Cached => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockedEvent {
    pub timestamp_ms: u64,
    pub domain: String,
    pub source: BlockSource,
}

impl BlockedEvent {
    pub fn new(domain: impl Into<String>, source: BlockSource) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            domain: domain.into(),
            source,
        }
    }
}

#[derive(Default)]
struct TelemetryInner {
    events: VecDeque<BlockedEvent>,
    dropped: u64,
}

/// Bounded feed of block decisions for the host UI.
#[derive(Default)]
pub struct Telemetry {
    inner: Mutex<TelemetryInner>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TelemetryInner {
                events: VecDeque::with_capacity(MAX_EVENTS),
                dropped: 0,
            }),
        }
    }

    pub fn record(&self, event: BlockedEvent) {
        let mut guard = self.inner.lock();
        if guard.events.len() >= MAX_EVENTS {
            guard.events.pop_front();
            guard.dropped = guard.dropped.saturating_add(1);
            logger::breadcrumb(
                BreadcrumbFlags::FILTER,
                "blocked-event backlog saturated, dropping oldest event",
            );
        }
        guard.events.push_back(event);
    }

    /// Pops up to `max_events` oldest events and the number lost since the last drain.
    pub fn drain(&self, max_events: usize) -> (Vec<BlockedEvent>, u64) {
        let mut guard = self.inner.lock();
        let take = max_events.min(guard.events.len());
        let drained = guard.events.drain(..take).collect();
        let dropped = std::mem::take(&mut guard.dropped);
        (drained, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_oldest_first() {
        let telemetry = Telemetry::new();
        telemetry.record(BlockedEvent::new("a.example", BlockSource::Cached));
        telemetry.record(BlockedEvent::new(
            "b.example",
            BlockSource::Filter(BlockReason::Keyword),
        ));
        let (events, dropped) = telemetry.drain(1);
        assert_eq!(dropped, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].domain, "a.example");
        let (rest, _) = telemetry.drain(10);
        assert_eq!(rest[0].source.code(), 2);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let telemetry = Telemetry::new();
        for idx in 0..MAX_EVENTS + 3 {
            telemetry.record(BlockedEvent::new(
                format!("host{idx}.example"),
                BlockSource::Filter(BlockReason::Exact),
            ));
        }
        let (events, dropped) = telemetry.drain(MAX_EVENTS * 2);
        assert_eq!(dropped, 3);
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0].domain, "host3.example");
        assert_eq!(telemetry.drain(1).1, 0);
    }
}
