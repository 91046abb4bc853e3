//! 监控核心
//!
//! Wires the interception point, the state accessor, the snapshot builder and
//! the sink together and owns the registration lifecycle.

pub mod hook;
pub mod metrics;
pub mod state;
pub mod tracker;

pub use hook::MonitorHook;
pub use metrics::{MonitorCounters, MonitorStats};
pub use state::{MonitorState, MonitorStatus};
pub use tracker::{Admission, ConnectionTracker, RatePolicy};

use log::{info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{EventClass, EventSource, FamilyFilter, HookId, HookSpec, PRIORITY_FIRST};
use crate::error::{MonitorError, RegistrationError, Result};
use crate::sink::EmissionSink;
use crate::snapshot::SRTT_SCALE_SHIFT;
use crate::state::ConnectionStateAccessor;

/// 监控配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// 钩子优先级, 越小越先执行
    pub priority: i32,
    pub family: FamilyFilter,
    /// 平滑 RTT 的定点缩放位数
    pub srtt_scale_shift: u32,
    pub rate_limit: RatePolicy,
    pub max_tracked_connections: usize,
    pub idle_timeout_secs: u64,
    pub netlink_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            priority: PRIORITY_FIRST,
            family: FamilyFilter::Any,
            srtt_scale_shift: SRTT_SCALE_SHIFT,
            rate_limit: RatePolicy::Interval { interval_ms: 1000 },
            max_tracked_connections: 65536,
            idle_timeout_secs: 120,
            netlink_timeout_ms: 200,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.srtt_scale_shift >= 64 {
            return Err(MonitorError::Config(format!(
                "srtt_scale_shift must be below 64, got {}",
                self.srtt_scale_shift
            )));
        }
        if let RatePolicy::EveryNEvents { n: 0 } = self.rate_limit {
            return Err(MonitorError::Config(
                "rate_limit.n must be at least 1".to_string(),
            ));
        }
        if self.max_tracked_connections == 0 {
            return Err(MonitorError::Config(
                "max_tracked_connections must be positive".to_string(),
            ));
        }
        if self.netlink_timeout_ms == 0 {
            return Err(MonitorError::Config(
                "netlink_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hook_spec(&self) -> HookSpec {
        HookSpec {
            event_class: EventClass::LocalOut,
            family: self.family,
            priority: self.priority,
        }
    }

    pub fn tracker(&self) -> ConnectionTracker {
        ConnectionTracker::new(
            self.rate_limit,
            self.max_tracked_connections,
            Duration::from_secs(self.idle_timeout_secs),
        )
    }
}

/// TCP 连接指标监控器
///
/// Inactive until [`start`](Self::start) registers its hook with the event
/// source. [`stop`](Self::stop) withdraws the hook; once it returns no
/// callback is running and no further snapshot reaches the sink.
pub struct TcpMonitor {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn EmissionSink>,
    hook: Arc<MonitorHook>,
    counters: Arc<MonitorCounters>,
    spec: HookSpec,
    registration: Mutex<Option<HookId>>,
    status: Mutex<MonitorStatus>,
}

impl TcpMonitor {
    pub fn new(
        source: Arc<dyn EventSource>,
        accessor: Arc<dyn ConnectionStateAccessor>,
        sink: Arc<dyn EmissionSink>,
        config: &MonitorConfig,
    ) -> Self {
        let counters = Arc::new(MonitorCounters::new());
        let hook = Arc::new(MonitorHook::new(
            accessor,
            Arc::clone(&sink),
            config.tracker(),
            Arc::clone(&counters),
            config.srtt_scale_shift,
        ));
        Self {
            source,
            sink,
            hook,
            counters,
            spec: config.hook_spec(),
            registration: Mutex::new(None),
            status: Mutex::new(MonitorStatus::new()),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            return Err(RegistrationError::AlreadyActive.into());
        }

        match self.source.subscribe(self.spec, self.hook.clone()) {
            Ok(id) => {
                *registration = Some(id);
                let mut status = self.status.lock();
                status.state = MonitorState::Running;
                status.started_at = Some(Instant::now());
                info!(
                    "tcp monitor started on {} at priority {}",
                    self.source.name(),
                    self.spec.priority
                );
                Ok(())
            }
            Err(e) => {
                warn!("tcp monitor failed to register: {}", e);
                let mut status = self.status.lock();
                status.state = MonitorState::Failed(e.to_string());
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Unregisters the hook and flushes the sink. Stopping an inactive
    /// monitor is a no-op.
    pub fn stop(&self) -> Result<()> {
        let Some(id) = self.registration.lock().take() else {
            return Ok(());
        };
        if let Err(e) = self.source.unsubscribe(id) {
            warn!("tcp monitor failed to unregister hook {}: {}", id, e);
            let mut status = self.status.lock();
            status.state = MonitorState::Failed(e.to_string());
            status.last_error = Some(e.to_string());
            return Err(e);
        }
        self.status.lock().state = MonitorState::Stopped;

        let stats = self.counters.snapshot();
        info!(
            "tcp monitor stopped: {} events, {} snapshots emitted, {} dropped by sink",
            stats.events_seen, stats.emitted, stats.sink_dropped
        );
        self.sink.flush()
    }

    pub fn is_active(&self) -> bool {
        self.status.lock().state.is_active()
    }

    pub fn state(&self) -> MonitorState {
        self.status.lock().state.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.status.lock().uptime()
    }

    pub fn stats(&self) -> MonitorStats {
        self.counters.snapshot()
    }

    pub fn tracked_connections(&self) -> usize {
        self.hook.tracked_connections()
    }
}

impl Drop for TcpMonitor {
    fn drop(&mut self) {
        if let Some(id) = self.registration.get_mut().take() {
            if let Err(e) = self.source.unsubscribe(id) {
                warn!("failed to unregister hook {} on drop: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ManualEventSource, PacketEvent, Verdict};
    use crate::protocol::{ConnectionKey, LinkLayer};
    use crate::sink::{MockEmissionSink, SinkOutcome};
    use crate::snapshot::MetricSnapshot;
    use crate::state::table::counters;
    use crate::state::{InMemoryStateTable, MockConnectionStateAccessor};
    use etherparse::PacketBuilder;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<MetricSnapshot>>,
    }

    impl RecordingSink {
        fn records(&self) -> Vec<MetricSnapshot> {
            self.records.lock().clone()
        }
    }

    impl EmissionSink for RecordingSink {
        fn accept(&self, snapshot: &MetricSnapshot) -> SinkOutcome {
            self.records.lock().push(snapshot.clone());
            SinkOutcome::Accepted
        }
    }

    const LOCAL: [u8; 4] = [10, 0, 0, 5];
    const REMOTE: [u8; 4] = [93, 184, 216, 34];

    fn key(port: u16) -> ConnectionKey {
        ConnectionKey::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(LOCAL)), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(REMOTE)), 443),
        )
    }

    fn tcp_frame(port: u16) -> Vec<u8> {
        let builder = PacketBuilder::ipv4(LOCAL, REMOTE, 64).tcp(port, 443, 1, 65535);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 16]).unwrap();
        frame
    }

    fn udp_frame() -> Vec<u8> {
        let builder = PacketBuilder::ipv4(LOCAL, REMOTE, 64).udp(5353, 53);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 8]).unwrap();
        frame
    }

    fn send(source: &ManualEventSource, frame: &[u8], at_ms: u64) -> Verdict {
        source.inject(&PacketEvent::outbound(
            LinkLayer::RawIp,
            frame,
            Duration::from_millis(at_ms),
        ))
    }

    fn unlimited() -> MonitorConfig {
        MonitorConfig {
            rate_limit: RatePolicy::Unlimited,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_reference_connection() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let sink = Arc::new(RecordingSink::default());
        table.upsert(counters(key(40000), 10, 500 << 3, 5, 1460, 2));

        let monitor = TcpMonitor::new(source.clone(), table, sink.clone(), &unlimited());
        monitor.start().unwrap();
        assert!(monitor.is_active());

        assert_eq!(send(&source, &tcp_frame(40000), 0), Verdict::Accept);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        let snapshot = &records[0];
        assert_eq!(snapshot.connection_id(), key(40000).fallback_id());
        assert_eq!(snapshot.congestion_window(), 10);
        assert_eq!(snapshot.smoothed_rtt_ms(), 500);
        assert_eq!(snapshot.bytes_in_flight(), 7300);
        assert_eq!(snapshot.retransmissions(), 2);
        assert!(!snapshot.overflowed());

        let stats = monitor.stats();
        assert_eq!(stats.events_seen, 1);
        assert_eq!(stats.sampled, 1);
        assert_eq!(stats.emitted, 1);
    }

    #[test]
    fn test_non_tcp_passes_through_untouched() {
        let source = Arc::new(ManualEventSource::new());
        let mut accessor = MockConnectionStateAccessor::new();
        accessor.expect_read().never();
        let mut sink = MockEmissionSink::new();
        sink.expect_accept().never();

        let monitor = TcpMonitor::new(source.clone(), Arc::new(accessor), Arc::new(sink), &unlimited());
        monitor.start().unwrap();

        assert_eq!(send(&source, &udp_frame(), 0), Verdict::Accept);
        assert_eq!(send(&source, &[0x45, 0x00], 1), Verdict::Accept);

        let stats = monitor.stats();
        assert_eq!(stats.events_seen, 2);
        assert_eq!(stats.not_applicable, 2);
        assert_eq!(stats.sampled, 0);
    }

    #[test]
    fn test_no_live_connection() {
        let source = Arc::new(ManualEventSource::new());
        let sink = Arc::new(RecordingSink::default());
        let monitor = TcpMonitor::new(
            source.clone(),
            Arc::new(InMemoryStateTable::new()),
            sink.clone(),
            &unlimited(),
        );
        monitor.start().unwrap();

        for i in 0..5 {
            assert_eq!(send(&source, &tcp_frame(40000), i), Verdict::Accept);
        }
        assert!(sink.records().is_empty());
        assert_eq!(monitor.stats().not_applicable, 5);
        assert_eq!(monitor.tracked_connections(), 0);
    }

    #[test]
    fn test_accessor_error_is_counted() {
        let source = Arc::new(ManualEventSource::new());
        let mut accessor = MockConnectionStateAccessor::new();
        accessor
            .expect_read()
            .times(2)
            .returning(|_| Err(MonitorError::Netlink("timed out".to_string())));
        let mut sink = MockEmissionSink::new();
        sink.expect_accept().never();

        let monitor = TcpMonitor::new(source.clone(), Arc::new(accessor), Arc::new(sink), &unlimited());
        monitor.start().unwrap();
        send(&source, &tcp_frame(40000), 0);
        send(&source, &tcp_frame(40000), 1);

        let stats = monitor.stats();
        assert_eq!(stats.accessor_errors, 2);
        assert_eq!(stats.emitted, 0);
    }

    #[test]
    fn test_priority_conflict() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let first = TcpMonitor::new(
            source.clone(),
            table.clone(),
            Arc::new(RecordingSink::default()),
            &unlimited(),
        );
        let second = TcpMonitor::new(
            source.clone(),
            table,
            Arc::new(RecordingSink::default()),
            &unlimited(),
        );

        first.start().unwrap();
        let err = second.start().unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Registration(RegistrationError::PriorityConflict { .. })
        ));
        assert!(!second.is_active());
        assert!(matches!(second.state(), MonitorState::Failed(_)));
        assert!(first.is_active());
        assert_eq!(source.hook_count(), 1);
    }

    #[test]
    fn test_double_start() {
        let source = Arc::new(ManualEventSource::new());
        let monitor = TcpMonitor::new(
            source.clone(),
            Arc::new(InMemoryStateTable::new()),
            Arc::new(RecordingSink::default()),
            &unlimited(),
        );
        monitor.start().unwrap();
        let err = monitor.start().unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Registration(RegistrationError::AlreadyActive)
        ));
        assert!(monitor.is_active());
        assert_eq!(source.hook_count(), 1);
    }

    #[test]
    fn test_stop_and_restart() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let sink = Arc::new(RecordingSink::default());
        table.upsert(counters(key(40000), 10, 4000, 5, 1460, 2));

        let monitor = TcpMonitor::new(source.clone(), table, sink.clone(), &unlimited());
        assert_eq!(monitor.state(), MonitorState::Initial);
        // stopping before start is harmless
        monitor.stop().unwrap();

        monitor.start().unwrap();
        send(&source, &tcp_frame(40000), 0);
        monitor.stop().unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(source.hook_count(), 0);

        send(&source, &tcp_frame(40000), 1);
        assert_eq!(sink.records().len(), 1);

        monitor.start().unwrap();
        send(&source, &tcp_frame(40000), 2);
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_drop_unregisters() {
        let source = Arc::new(ManualEventSource::new());
        {
            let monitor = TcpMonitor::new(
                source.clone(),
                Arc::new(InMemoryStateTable::new()),
                Arc::new(RecordingSink::default()),
                &unlimited(),
            );
            monitor.start().unwrap();
            assert_eq!(source.hook_count(), 1);
        }
        assert_eq!(source.hook_count(), 0);
    }

    #[test]
    fn test_stop_flushes_sink() {
        let source = Arc::new(ManualEventSource::new());
        let mut sink = MockEmissionSink::new();
        sink.expect_flush().times(1).returning(|| Ok(()));

        let monitor = TcpMonitor::new(
            source,
            Arc::new(InMemoryStateTable::new()),
            Arc::new(sink),
            &unlimited(),
        );
        monitor.start().unwrap();
        monitor.stop().unwrap();
        // second stop does not flush again
        monitor.stop().unwrap();
    }

    /// Accepts registrations but refuses to give them back.
    #[derive(Default)]
    struct StickySource {
        inner: ManualEventSource,
    }

    impl EventSource for StickySource {
        fn name(&self) -> &str {
            "sticky"
        }

        fn subscribe(&self, spec: HookSpec, hook: Arc<dyn crate::capture::PacketHook>) -> Result<HookId> {
            self.inner.subscribe(spec, hook)
        }

        fn unsubscribe(&self, id: HookId) -> Result<()> {
            Err(RegistrationError::UnknownHook(id.0).into())
        }
    }

    #[test]
    fn test_failed_unregister_is_not_active() {
        let source = Arc::new(StickySource::default());
        let monitor = TcpMonitor::new(
            source,
            Arc::new(InMemoryStateTable::new()),
            Arc::new(RecordingSink::default()),
            &unlimited(),
        );
        monitor.start().unwrap();
        assert!(monitor.is_active());

        let err = monitor.stop().unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Registration(RegistrationError::UnknownHook(_))
        ));
        assert!(!monitor.is_active());
        assert!(matches!(monitor.state(), MonitorState::Failed(_)));
    }

    #[test]
    fn test_concurrent_events_every_n() {
        const CONNECTIONS: u16 = 100;
        const EVENTS_PER_CONNECTION: u32 = 100;
        const THREADS: u16 = 4;

        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let sink = Arc::new(RecordingSink::default());
        for i in 0..CONNECTIONS {
            table.upsert(counters(key(20000 + i), 10, 800, 2, 1000, 0));
        }

        let config = MonitorConfig {
            rate_limit: RatePolicy::EveryNEvents { n: 10 },
            ..MonitorConfig::default()
        };
        let monitor = TcpMonitor::new(source.clone(), table.clone(), sink.clone(), &config);
        monitor.start().unwrap();

        let per_thread = CONNECTIONS / THREADS;
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let source = Arc::clone(&source);
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let ports: Vec<u16> = (0..per_thread).map(|i| 20000 + t * per_thread + i).collect();
                    for round in 0..EVENTS_PER_CONNECTION {
                        for &port in &ports {
                            table.update(&key(port), |c| c.retransmissions += 1);
                            let verdict = send(&source, &tcp_frame(port), u64::from(round));
                            assert_eq!(verdict, Verdict::Accept);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut per_connection: HashMap<u16, Vec<u32>> = HashMap::new();
        for record in sink.records() {
            let port = record.key().unwrap().local.port();
            per_connection.entry(port).or_default().push(record.retransmissions());
        }
        assert_eq!(per_connection.len(), usize::from(CONNECTIONS));
        for (port, retrans) in &per_connection {
            assert_eq!(retrans.len(), 10, "connection {}", port);
            assert!(retrans.windows(2).all(|w| w[0] < w[1]), "connection {}", port);
        }

        let stats = monitor.stats();
        assert_eq!(stats.events_seen, 10_000);
        assert_eq!(stats.emitted, 1_000);
        assert_eq!(stats.rate_limited, 9_000);
    }

    #[test]
    fn test_interval_with_equal_timestamps() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let sink = Arc::new(RecordingSink::default());
        table.upsert(counters(key(40000), 10, 4000, 5, 1460, 2));
        table.upsert(counters(key(40001), 20, 8000, 1, 1460, 0));

        let config = MonitorConfig {
            rate_limit: RatePolicy::Interval { interval_ms: 100 },
            ..MonitorConfig::default()
        };
        let monitor = TcpMonitor::new(source.clone(), table, sink.clone(), &config);
        monitor.start().unwrap();

        for _ in 0..50 {
            send(&source, &tcp_frame(40000), 7);
            send(&source, &tcp_frame(40001), 7);
        }
        assert_eq!(sink.records().len(), 2);
        assert_eq!(monitor.stats().rate_limited, 98);
    }

    #[test]
    fn test_sink_backpressure_is_counted() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        table.upsert(counters(key(40000), 10, 4000, 5, 1460, 2));
        let mut sink = MockEmissionSink::new();
        sink.expect_accept()
            .times(3)
            .returning(|_| SinkOutcome::Backpressure);

        let monitor = TcpMonitor::new(source.clone(), table, Arc::new(sink), &unlimited());
        monitor.start().unwrap();
        for i in 0..3 {
            assert_eq!(send(&source, &tcp_frame(40000), i), Verdict::Accept);
        }

        let stats = monitor.stats();
        assert_eq!(stats.sampled, 3);
        assert_eq!(stats.sink_dropped, 3);
        assert_eq!(stats.emitted, 0);
    }

    #[test]
    fn test_retransmissions_clamped() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let sink = Arc::new(RecordingSink::default());
        table.upsert(counters(key(40000), 10, 4000, 5, 1460, 6));

        let monitor = TcpMonitor::new(source.clone(), table.clone(), sink.clone(), &unlimited());
        monitor.start().unwrap();
        send(&source, &tcp_frame(40000), 0);
        table.update(&key(40000), |c| c.retransmissions = 4);
        send(&source, &tcp_frame(40000), 1);

        let retrans: Vec<_> = sink.records().iter().map(|r| r.retransmissions()).collect();
        assert_eq!(retrans, vec![6, 6]);
        assert_eq!(monitor.stats().retransmissions_clamped, 1);
    }

    #[test]
    fn test_overflow_is_flagged() {
        let source = Arc::new(ManualEventSource::new());
        let table = Arc::new(InMemoryStateTable::new());
        let sink = Arc::new(RecordingSink::default());
        table.upsert(counters(key(40000), 10, 4000, u32::MAX, 1460, 0));

        let monitor = TcpMonitor::new(source.clone(), table, sink.clone(), &unlimited());
        monitor.start().unwrap();
        send(&source, &tcp_frame(40000), 0);

        let records = sink.records();
        assert_eq!(records[0].bytes_in_flight(), u32::MAX);
        assert!(records[0].overflowed());
        assert_eq!(monitor.stats().overflowed, 1);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config: MonitorConfig = serde_yaml::from_str("rate_limit:\n  mode: every_n_events\n  n: 5\n").unwrap();
        assert_eq!(config.rate_limit, RatePolicy::EveryNEvents { n: 5 });
        assert_eq!(config.priority, PRIORITY_FIRST);
        assert_eq!(config.srtt_scale_shift, 3);
        assert!(config.validate().is_ok());

        let zero = MonitorConfig {
            rate_limit: RatePolicy::EveryNEvents { n: 0 },
            ..MonitorConfig::default()
        };
        assert!(matches!(zero.validate(), Err(MonitorError::Config(_))));

        let shift = MonitorConfig {
            srtt_scale_shift: 64,
            ..MonitorConfig::default()
        };
        assert!(shift.validate().is_err());
    }
}
