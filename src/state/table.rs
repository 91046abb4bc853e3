use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::protocol::ConnectionKey;
use crate::state::{ConnectionStateAccessor, TcpCounters};

/// Accessor over a table of known connections.
///
/// Used for replaying recorded counters and as a stand-in for the kernel in
/// tests. Writers update whole entries, readers get a copy.
#[derive(Default)]
pub struct InMemoryStateTable {
    connections: RwLock<HashMap<ConnectionKey, TcpCounters>>,
}

impl InMemoryStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, counters: TcpCounters) {
        self.connections.write().insert(counters.handle.key, counters);
    }

    /// Applies `update` to an existing entry. Returns false when the
    /// connection is unknown.
    pub fn update<F>(&self, key: &ConnectionKey, update: F) -> bool
    where
        F: FnOnce(&mut TcpCounters),
    {
        match self.connections.write().get_mut(key) {
            Some(counters) => {
                update(counters);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &ConnectionKey) -> Option<TcpCounters> {
        self.connections.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionStateAccessor for InMemoryStateTable {
    fn read(&self, key: &ConnectionKey) -> Result<Option<TcpCounters>> {
        Ok(self.connections.read().get(key).copied())
    }
}

/// Counters for a connection with the given raw values and no cookie.
#[cfg(test)]
pub fn counters(
    key: ConnectionKey,
    congestion_window: u32,
    srtt_raw: u64,
    packets_in_flight: u32,
    mss: u32,
    retransmissions: u32,
) -> TcpCounters {
    TcpCounters {
        handle: crate::state::ConnectionHandle::new(key, None),
        congestion_window,
        srtt_raw,
        packets_in_flight,
        mss,
        retransmissions,
    }
}
