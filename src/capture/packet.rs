use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pcap::{Active, Capture, Device};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::hook::{EventSource, HookId, HookSpec, PacketEvent, PacketHook};
use crate::capture::interface::InterfaceManager;
use crate::capture::registry::HookRegistry;
use crate::capture::{CaptureConfig, CaptureDirection};
use crate::error::{MonitorError, RegistrationError, Result};
use crate::protocol::{source_address, LinkLayer};

/// pcap 统计信息刷新间隔(包数)
const STATS_REFRESH_PACKETS: u64 = 1024;

#[derive(Default)]
pub struct CaptureStats {
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    packets_if_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureCounters {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_if_dropped: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_if_dropped: self.packets_if_dropped.load(Ordering::Relaxed),
        }
    }
}

/// 抓包句柄, 在独立线程中运行
struct PacketCapture {
    cap: Capture<Active>,
    link: LinkLayer,
    /// Set when the handle cannot select the outbound direction itself.
    local_filter: Option<Vec<IpAddr>>,
    stats: Arc<CaptureStats>,
}

impl PacketCapture {
    fn open(config: &CaptureConfig, local_addresses: &[IpAddr], stats: Arc<CaptureStats>) -> Result<Self> {
        // 查找网络接口
        let device = Device::list()?
            .into_iter()
            .find(|dev| dev.name == config.interface_name)
            .ok_or_else(|| {
                MonitorError::Capture(format!("Interface {} not found", config.interface_name))
            })?;

        let mut cap = Capture::from_device(device)?
            .promisc(config.promiscuous)
            .snaplen(config.snapshot_length)
            .buffer_size(config.buffer_size)
            .timeout(config.timeout_ms)
            .immediate_mode(true)
            .open()?;

        if !config.bpf_filter.is_empty() {
            cap.filter(&config.bpf_filter, true)?;
        }

        let dlt = cap.get_datalink();
        let link = LinkLayer::from_dlt(dlt.0)
            .ok_or_else(|| MonitorError::Capture(format!("Unsupported link type {:?}", dlt)))?;

        let local_filter = match config.direction {
            CaptureDirection::InOut => None,
            CaptureDirection::Out => match cap.direction(pcap::Direction::Out) {
                Ok(()) => None,
                Err(e) => {
                    warn!(
                        "{}: direction filter unavailable ({}), matching on local source address",
                        config.interface_name, e
                    );
                    Some(local_addresses.to_vec())
                }
            },
        };

        Ok(Self {
            cap,
            link,
            local_filter,
            stats,
        })
    }

    fn run(mut self, registry: Arc<HookRegistry>, running: Arc<AtomicBool>) {
        let mut since_refresh = 0u64;

        while running.load(Ordering::Acquire) {
            match self.cap.next_packet() {
                Ok(packet) => {
                    self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                    since_refresh += 1;

                    let is_outbound = match &self.local_filter {
                        None => true,
                        Some(local) => source_address(self.link, packet.data)
                            .map_or(false, |src| local.contains(&src)),
                    };
                    if is_outbound {
                        let event = PacketEvent::outbound(
                            self.link,
                            packet.data,
                            timeval_to_duration(&packet.header.ts),
                        );
                        registry.dispatch(&event);
                    }
                    if since_refresh < STATS_REFRESH_PACKETS {
                        continue;
                    }
                }
                Err(pcap::Error::TimeoutExpired) => {}
                Err(e) => {
                    error!("Packet capture error: {}", e);
                    break;
                }
            }

            // 更新统计信息
            since_refresh = 0;
            if let Ok(pcap_stats) = self.cap.stats() {
                self.stats
                    .packets_dropped
                    .store(u64::from(pcap_stats.dropped), Ordering::Relaxed);
                self.stats
                    .packets_if_dropped
                    .store(u64::from(pcap_stats.if_dropped), Ordering::Relaxed);
            }
        }
        debug!("capture loop finished");
    }
}

fn timeval_to_duration(ts: &libc::timeval) -> Duration {
    let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
    let micros = u32::try_from(ts.tv_usec).unwrap_or(0).min(999_999);
    Duration::new(secs, micros * 1000)
}

struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CaptureWorker {
    fn stop(self) {
        self.running.store(false, Ordering::Release);
        if self.handle.join().is_err() {
            error!("capture thread panicked");
        }
    }
}

/// Live outbound packet source on one interface.
///
/// The capture handle is opened when the first hook subscribes and closed
/// when the last one leaves.
pub struct PcapEventSource {
    config: CaptureConfig,
    local_addresses: Vec<IpAddr>,
    registry: Arc<HookRegistry>,
    worker: Mutex<Option<CaptureWorker>>,
    stats: Arc<CaptureStats>,
}

impl PcapEventSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let interface = InterfaceManager::new(&config.interface_name)?;
        if !interface.is_up() {
            warn!("interface {} is down", config.interface_name);
        }
        Ok(Self {
            local_addresses: interface.local_addresses(),
            config,
            registry: Arc::new(HookRegistry::new()),
            worker: Mutex::new(None),
            stats: Arc::new(CaptureStats::default()),
        })
    }

    pub fn stats(&self) -> CaptureCounters {
        self.stats.snapshot()
    }

    fn spawn_worker(&self) -> Result<CaptureWorker> {
        let capture = PacketCapture::open(&self.config, &self.local_addresses, Arc::clone(&self.stats))?;
        let running = Arc::new(AtomicBool::new(true));
        let registry = Arc::clone(&self.registry);
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.config.interface_name))
            .spawn(move || capture.run(registry, flag))?;
        info!("capturing outbound packets on {}", self.config.interface_name);
        Ok(CaptureWorker { running, handle })
    }
}

impl EventSource for PcapEventSource {
    fn name(&self) -> &str {
        &self.config.interface_name
    }

    fn subscribe(&self, spec: HookSpec, hook: Arc<dyn PacketHook>) -> Result<HookId> {
        // worker lock first: registry contents and worker lifetime change together
        let mut worker = self.worker.lock();
        let id = self.registry.register(spec, hook)?;
        if worker.is_none() {
            match self.spawn_worker() {
                Ok(w) => *worker = Some(w),
                Err(e) => {
                    let _ = self.registry.unregister(id);
                    return Err(RegistrationError::Source(e.to_string()).into());
                }
            }
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: HookId) -> Result<()> {
        let mut worker = self.worker.lock();
        self.registry.unregister(id)?;
        if self.registry.is_empty() {
            if let Some(w) = worker.take() {
                w.stop();
                info!("capture on {} stopped", self.config.interface_name);
            }
        }
        Ok(())
    }
}

impl Drop for PcapEventSource {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_conversion() {
        let ts = libc::timeval {
            tv_sec: 1_700_000_000,
            tv_usec: 250_000,
        };
        assert_eq!(
            timeval_to_duration(&ts),
            Duration::from_secs(1_700_000_000) + Duration::from_millis(250)
        );

        let negative = libc::timeval {
            tv_sec: -1,
            tv_usec: -1,
        };
        assert_eq!(timeval_to_duration(&negative), Duration::ZERO);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = CaptureStats::default();
        stats.packets_received.fetch_add(3, Ordering::Relaxed);
        stats.packets_dropped.store(1, Ordering::Relaxed);
        assert_eq!(
            stats.snapshot(),
            CaptureCounters {
                packets_received: 3,
                packets_dropped: 1,
                packets_if_dropped: 0,
            }
        );
    }

    struct Idle;

    impl PacketHook for Idle {
        fn on_event(&self, _event: &PacketEvent<'_>) -> crate::capture::Verdict {
            crate::capture::Verdict::Accept
        }
    }

    fn spec(priority: i32) -> HookSpec {
        HookSpec {
            event_class: crate::capture::EventClass::LocalOut,
            family: crate::capture::FamilyFilter::Any,
            priority,
        }
    }

    #[test]
    fn test_worker_follows_registrations() {
        let source = PcapEventSource::new(CaptureConfig {
            interface_name: "lo".to_string(),
            ..Default::default()
        })
        .unwrap();

        match source.subscribe(spec(0), Arc::new(Idle)) {
            Ok(first) => {
                // capture could be opened (privileged run)
                assert!(source.worker.lock().is_some());
                let second = source.subscribe(spec(1), Arc::new(Idle)).unwrap();
                source.unsubscribe(first).unwrap();
                assert!(source.worker.lock().is_some());
                source.unsubscribe(second).unwrap();
            }
            Err(e) => {
                assert!(matches!(
                    e,
                    MonitorError::Registration(RegistrationError::Source(_))
                ));
            }
        }
        assert!(source.registry.is_empty());
        assert!(source.worker.lock().is_none());
    }

    #[test]
    fn test_source_requires_interface() {
        let config = CaptureConfig {
            interface_name: "tcpmon-missing0".to_string(),
            ..Default::default()
        };
        assert!(PcapEventSource::new(config).is_err());
    }
}
