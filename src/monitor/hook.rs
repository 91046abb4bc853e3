use log::{debug, trace};
use std::sync::Arc;

use crate::capture::{PacketEvent, PacketHook, Verdict};
use crate::monitor::metrics::{bump, MonitorCounters};
use crate::monitor::tracker::{Admission, ConnectionTracker};
use crate::protocol::outbound_tcp_key;
use crate::sink::{EmissionSink, SinkOutcome};
use crate::snapshot::MetricSnapshot;
use crate::state::ConnectionStateAccessor;

/// Interception callback: resolves each outbound segment to its connection,
/// samples its counters and hands the snapshot to the sink.
///
/// Every outcome, including errors, is handled here; the packet always
/// continues with `Verdict::Accept`.
pub struct MonitorHook {
    accessor: Arc<dyn ConnectionStateAccessor>,
    sink: Arc<dyn EmissionSink>,
    tracker: ConnectionTracker,
    counters: Arc<MonitorCounters>,
    srtt_shift: u32,
}

impl MonitorHook {
    pub fn new(
        accessor: Arc<dyn ConnectionStateAccessor>,
        sink: Arc<dyn EmissionSink>,
        tracker: ConnectionTracker,
        counters: Arc<MonitorCounters>,
        srtt_shift: u32,
    ) -> Self {
        Self {
            accessor,
            sink,
            tracker,
            counters,
            srtt_shift,
        }
    }

    pub fn tracked_connections(&self) -> usize {
        self.tracker.len()
    }

    fn observe(&self, event: &PacketEvent<'_>) {
        bump(&self.counters.events_seen);

        let Some(key) = outbound_tcp_key(event.link, event.data) else {
            bump(&self.counters.not_applicable);
            return;
        };

        match self.tracker.admit(&key, event.timestamp) {
            Admission::Sample => {}
            Admission::RateLimited => {
                bump(&self.counters.rate_limited);
                return;
            }
            Admission::Untracked => {
                bump(&self.counters.untracked);
                return;
            }
        }

        let mut counters = match self.accessor.read(&key) {
            Ok(Some(counters)) => counters,
            Ok(None) => {
                trace!("{}: no live tcp socket", key);
                bump(&self.counters.not_applicable);
                self.tracker.forget(&key);
                return;
            }
            Err(e) => {
                debug!("{}: state read failed: {}", key, e);
                bump(&self.counters.accessor_errors);
                return;
            }
        };

        if self.tracker.reconcile_retransmissions(&mut counters) {
            bump(&self.counters.retransmissions_clamped);
        }

        let snapshot = MetricSnapshot::build(&counters, self.srtt_shift, event.timestamp);
        bump(&self.counters.sampled);
        if snapshot.overflowed() {
            bump(&self.counters.overflowed);
        }

        match self.sink.accept(&snapshot) {
            SinkOutcome::Accepted => bump(&self.counters.emitted),
            SinkOutcome::Backpressure => bump(&self.counters.sink_dropped),
        }
    }
}

impl PacketHook for MonitorHook {
    fn on_event(&self, event: &PacketEvent<'_>) -> Verdict {
        self.observe(event);
        Verdict::Accept
    }
}
