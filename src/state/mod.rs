//! Connection state access.
//!
//! An accessor answers one question: given the 4-tuple of an outbound segment,
//! what are the owning socket's transport counters right now. Reads are
//! point-in-time and best effort; the five counters may be sampled at slightly
//! different instants and no cross-field atomicity is promised.

pub mod netlink;
pub mod table;
pub mod tcp_info;

pub use netlink::NetlinkStateAccessor;
pub use table::InMemoryStateTable;
pub use tcp_info::TcpInfo;

use crate::error::Result;
use crate::protocol::{ConnectionId, ConnectionKey};

/// Transient reference to one live connection, valid for a single callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub key: ConnectionKey,
    /// Kernel socket cookie, when the host exposes one.
    pub cookie: Option<u64>,
}

impl ConnectionHandle {
    pub fn new(key: ConnectionKey, cookie: Option<u64>) -> Self {
        Self { key, cookie }
    }

    pub fn id(&self) -> ConnectionId {
        match self.cookie {
            Some(cookie) => ConnectionId(cookie),
            None => self.key.fallback_id(),
        }
    }
}

/// Raw counters as read from the transport stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpCounters {
    pub handle: ConnectionHandle,
    pub congestion_window: u32,
    /// Smoothed RTT in milliseconds, left-shifted by the builder's scale shift.
    pub srtt_raw: u64,
    pub packets_in_flight: u32,
    pub mss: u32,
    pub retransmissions: u32,
}

/// Reads the transport state of the connection owning a 4-tuple.
///
/// `Ok(None)` means not applicable: no live TCP connection matches. `Err` is
/// an accessor failure; callers treat it like `Ok(None)` after counting it.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionStateAccessor: Send + Sync {
    fn read(&self, key: &ConnectionKey) -> Result<Option<TcpCounters>>;
}
