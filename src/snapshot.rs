//! Metric snapshot construction.
//!
//! A snapshot is built once from the counters read inside a single callback
//! and never changed afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::protocol::{ConnectionId, ConnectionKey};
use crate::state::TcpCounters;

/// Fixed-point shift of the kernel's smoothed RTT estimator.
pub const SRTT_SCALE_SHIFT: u32 = 3;

/// Record prefix, shared with the kernel module's printk output so existing
/// log processors keep working.
pub const LOG_PREFIX: &str = "TCP_MONITOR:";

/// Removes the estimator scale: `raw >> shift`.
pub fn srtt_to_ms(raw: u64, shift: u32) -> u64 {
    raw.checked_shr(shift).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<ConnectionKey>,
    congestion_window: u32,
    smoothed_rtt_ms: u32,
    bytes_in_flight: u32,
    retransmissions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sending_rate_kbps: Option<u64>,
    #[serde(default)]
    overflowed: bool,
    #[serde(default)]
    timestamp_us: u64,
}

impl MetricSnapshot {
    /// Derives the snapshot from raw counters.
    ///
    /// `bytes_in_flight` is always `packets_in_flight * mss`; a product or RTT
    /// that does not fit in 32 bits saturates and sets `overflowed`.
    pub fn build(counters: &TcpCounters, srtt_shift: u32, timestamp: Duration) -> Self {
        let mut overflowed = false;

        let rtt_ms = srtt_to_ms(counters.srtt_raw, srtt_shift);
        let smoothed_rtt_ms = u32::try_from(rtt_ms).unwrap_or_else(|_| {
            overflowed = true;
            u32::MAX
        });

        let bytes_in_flight = counters
            .packets_in_flight
            .checked_mul(counters.mss)
            .unwrap_or_else(|| {
                overflowed = true;
                u32::MAX
            });

        Self {
            connection_id: counters.handle.id(),
            key: Some(counters.handle.key),
            congestion_window: counters.congestion_window,
            smoothed_rtt_ms,
            bytes_in_flight,
            retransmissions: counters.retransmissions,
            sending_rate_kbps: sending_rate_kbps(bytes_in_flight, smoothed_rtt_ms),
            overflowed,
            timestamp_us: u64::try_from(timestamp.as_micros()).unwrap_or(u64::MAX),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn key(&self) -> Option<&ConnectionKey> {
        self.key.as_ref()
    }

    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    pub fn smoothed_rtt_ms(&self) -> u32 {
        self.smoothed_rtt_ms
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// One window per RTT: `bytes_in_flight * 8 / rtt_ms`, in kbit/s.
    pub fn sending_rate_kbps(&self) -> Option<u64> {
        self.sending_rate_kbps
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Single-line `key=value` rendering.
    pub fn to_log_line(&self) -> String {
        self.to_string()
    }

    /// Parses a line produced by [`MetricSnapshot::to_log_line`] (or the
    /// kernel module), ignoring any syslog prefix before the record marker.
    pub fn parse_log_line(line: &str) -> Option<Self> {
        let record = &line[line.find(LOG_PREFIX)? + LOG_PREFIX.len()..];

        let mut sock = None;
        let mut cwnd = None;
        let mut rtt = None;
        let mut bytes_in_flight = None;
        let mut retrans = None;
        let mut overflowed = false;

        for field in record.split_whitespace() {
            let (name, value) = field.split_once('=')?;
            match name {
                "sock" => sock = parse_id(value),
                "cwnd" => cwnd = value.parse().ok(),
                "rtt" => rtt = value.parse().ok(),
                "bytes_in_flight" => bytes_in_flight = value.parse().ok(),
                "retrans" => retrans = value.parse().ok(),
                "overflowed" => overflowed = value == "1",
                _ => {}
            }
        }

        let smoothed_rtt_ms = rtt?;
        let bytes_in_flight = bytes_in_flight?;
        Some(Self {
            connection_id: ConnectionId(sock?),
            key: None,
            congestion_window: cwnd?,
            smoothed_rtt_ms,
            bytes_in_flight,
            retransmissions: retrans?,
            sending_rate_kbps: sending_rate_kbps(bytes_in_flight, smoothed_rtt_ms),
            overflowed,
            timestamp_us: 0,
        })
    }
}

impl fmt::Display for MetricSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sock={} cwnd={} rtt={} bytes_in_flight={} retrans={}",
            LOG_PREFIX,
            self.connection_id,
            self.congestion_window,
            self.smoothed_rtt_ms,
            self.bytes_in_flight,
            self.retransmissions
        )?;
        if self.overflowed {
            write!(f, " overflowed=1")?;
        }
        Ok(())
    }
}

fn sending_rate_kbps(bytes_in_flight: u32, rtt_ms: u32) -> Option<u64> {
    if rtt_ms == 0 {
        return None;
    }
    Some(u64::from(bytes_in_flight) * 8 / u64::from(rtt_ms))
}

/// Socket ids are hex: `%p` in kernel output, `{:#018x}` in ours.
fn parse_id(value: &str) -> Option<u64> {
    let hex = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(hex, 16).ok()
}
