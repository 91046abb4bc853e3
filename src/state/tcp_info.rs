//! Decoding of the kernel's `struct tcp_info`.
//!
//! Only the leading, stable part of the structure is decoded (everything up to
//! and including `tcpi_total_retrans`, 104 bytes). Newer kernels append fields
//! after it, older layouts never shrink it.

use bytes::Buf;

use crate::error::{MonitorError, Result};
use crate::state::{ConnectionHandle, TcpCounters};

/// Size of `struct tcp_info` up to and including `tcpi_total_retrans`.
pub const TCP_INFO_MIN_LEN: usize = 104;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub rto_us: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub pmtu: u32,
    /// `srtt_us >> 3`, microseconds.
    pub rtt_us: u32,
    pub rttvar_us: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub total_retrans: u32,
}

impl TcpInfo {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TCP_INFO_MIN_LEN {
            return Err(MonitorError::Netlink(format!(
                "tcp_info too short: {} bytes (need {})",
                data.len(),
                TCP_INFO_MIN_LEN
            )));
        }
        let mut buf = &data[..TCP_INFO_MIN_LEN];

        let state = buf.get_u8();
        let ca_state = buf.get_u8();
        let retransmits = buf.get_u8();
        // probes, backoff, options, wscale, delivery flags
        buf.advance(5);
        let rto_us = buf.get_u32_ne();
        let _ato = buf.get_u32_ne();
        let snd_mss = buf.get_u32_ne();
        let rcv_mss = buf.get_u32_ne();
        let unacked = buf.get_u32_ne();
        let sacked = buf.get_u32_ne();
        let lost = buf.get_u32_ne();
        let retrans = buf.get_u32_ne();
        // fackets and the four last_* timestamps
        buf.advance(20);
        let pmtu = buf.get_u32_ne();
        let _rcv_ssthresh = buf.get_u32_ne();
        let rtt_us = buf.get_u32_ne();
        let rttvar_us = buf.get_u32_ne();
        let snd_ssthresh = buf.get_u32_ne();
        let snd_cwnd = buf.get_u32_ne();
        let advmss = buf.get_u32_ne();
        // reordering, rcv_rtt, rcv_space
        buf.advance(12);
        let total_retrans = buf.get_u32_ne();

        Ok(Self {
            state,
            ca_state,
            retransmits,
            rto_us,
            snd_mss,
            rcv_mss,
            unacked,
            sacked,
            lost,
            retrans,
            pmtu,
            rtt_us,
            rttvar_us,
            snd_ssthresh,
            snd_cwnd,
            advmss,
            total_retrans,
        })
    }

    /// Same accounting as the kernel's `tcp_packets_in_flight()`:
    /// `packets_out - (sacked_out + lost_out) + retrans_out`.
    pub fn packets_in_flight(&self) -> u32 {
        self.unacked
            .saturating_sub(self.sacked.saturating_add(self.lost))
            .saturating_add(self.retrans)
    }

    /// Smoothed RTT re-expressed as whole milliseconds shifted left by `shift`.
    pub fn srtt_raw(&self, shift: u32) -> u64 {
        // (us << shift) / 1000 keeps sub-millisecond precision in the low bits,
        // so `raw >> shift` yields exactly floor(us / 1000)
        if shift >= u64::BITS {
            return u64::MAX;
        }
        let scaled = (u128::from(self.rtt_us) << shift) / 1000;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }

    pub fn to_counters(&self, handle: ConnectionHandle, shift: u32) -> TcpCounters {
        TcpCounters {
            handle,
            congestion_window: self.snd_cwnd,
            srtt_raw: self.srtt_raw(shift),
            packets_in_flight: self.packets_in_flight(),
            mss: self.snd_mss,
            retransmissions: self.total_retrans,
        }
    }
}
