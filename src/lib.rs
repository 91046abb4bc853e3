//! 出方向 TCP 连接指标监控
//!
//! Observes locally generated TCP segments, samples the owning connection's
//! congestion window, smoothed RTT, bytes in flight and retransmissions, and
//! emits one snapshot per sampled segment.

pub mod capture;
pub mod cli;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod sink;
pub mod snapshot;
pub mod state;

pub use error::{MonitorError, RegistrationError, Result};
pub use monitor::{MonitorConfig, MonitorState, MonitorStats, RatePolicy, TcpMonitor};
pub use snapshot::MetricSnapshot;
