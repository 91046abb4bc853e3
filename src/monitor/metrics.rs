use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated on the packet path.
#[derive(Debug, Default)]
pub struct MonitorCounters {
    pub(crate) events_seen: AtomicU64,
    pub(crate) not_applicable: AtomicU64,
    pub(crate) rate_limited: AtomicU64,
    pub(crate) untracked: AtomicU64,
    pub(crate) accessor_errors: AtomicU64,
    pub(crate) sampled: AtomicU64,
    pub(crate) emitted: AtomicU64,
    pub(crate) sink_dropped: AtomicU64,
    pub(crate) overflowed: AtomicU64,
    pub(crate) retransmissions_clamped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub events_seen: u64,
    pub not_applicable: u64,
    pub rate_limited: u64,
    pub untracked: u64,
    pub accessor_errors: u64,
    pub sampled: u64,
    pub emitted: u64,
    pub sink_dropped: u64,
    pub overflowed: u64,
    pub retransmissions_clamped: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MonitorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MonitorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MonitorStats {
            events_seen: load(&self.events_seen),
            not_applicable: load(&self.not_applicable),
            rate_limited: load(&self.rate_limited),
            untracked: load(&self.untracked),
            accessor_errors: load(&self.accessor_errors),
            sampled: load(&self.sampled),
            emitted: load(&self.emitted),
            sink_dropped: load(&self.sink_dropped),
            overflowed: load(&self.overflowed),
            retransmissions_clamped: load(&self.retransmissions_clamped),
        }
    }
}
