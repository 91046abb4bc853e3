use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::protocol::ConnectionKey;
use crate::state::TcpCounters;

const SHARDS: usize = 16;

/// How often a single connection may be sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RatePolicy {
    /// Every outbound segment produces a snapshot.
    Unlimited,
    /// The first event, then every `n`-th.
    EveryNEvents { n: u32 },
    /// At most once per interval of capture time.
    Interval { interval_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Sample,
    RateLimited,
    /// Tracking table is full; the event is not sampled.
    Untracked,
}

#[derive(Debug)]
struct TrackedConnection {
    events: u64,
    last_sample: Option<Duration>,
    last_seen: Duration,
    cookie: Option<u64>,
    last_retransmissions: u32,
}

impl TrackedConnection {
    fn new(now: Duration) -> Self {
        Self {
            events: 0,
            last_sample: None,
            last_seen: now,
            cookie: None,
            last_retransmissions: 0,
        }
    }
}

/// Per-connection sampling state.
///
/// Entries are spread over independently locked shards; each lock is held for
/// a constant amount of work except when a full shard evicts idle entries.
pub struct ConnectionTracker {
    policy: RatePolicy,
    shards: Box<[Mutex<HashMap<ConnectionKey, TrackedConnection>>]>,
    shard_capacity: usize,
    idle_timeout: Duration,
}

impl ConnectionTracker {
    pub fn new(policy: RatePolicy, max_connections: usize, idle_timeout: Duration) -> Self {
        let shards = (0..SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            policy,
            shards,
            shard_capacity: ((max_connections + SHARDS - 1) / SHARDS).max(1),
            idle_timeout,
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    fn shard(&self, key: &ConnectionKey) -> &Mutex<HashMap<ConnectionKey, TrackedConnection>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Records one event for `key` and decides whether it is sampled.
    pub fn admit(&self, key: &ConnectionKey, now: Duration) -> Admission {
        let mut shard = self.shard(key).lock();

        if !shard.contains_key(key) && shard.len() >= self.shard_capacity {
            let idle_timeout = self.idle_timeout;
            shard.retain(|_, c| now.saturating_sub(c.last_seen) < idle_timeout);
            if shard.len() >= self.shard_capacity {
                return Admission::Untracked;
            }
        }

        let entry = shard
            .entry(*key)
            .or_insert_with(|| TrackedConnection::new(now));
        entry.last_seen = entry.last_seen.max(now);
        let seq = entry.events;
        entry.events += 1;

        let sample = match self.policy {
            RatePolicy::Unlimited => true,
            RatePolicy::EveryNEvents { n } => seq % u64::from(n.max(1)) == 0,
            RatePolicy::Interval { interval_ms } => match entry.last_sample {
                None => true,
                Some(last) => now.saturating_sub(last) >= Duration::from_millis(interval_ms),
            },
        };
        if sample {
            entry.last_sample = Some(now);
            Admission::Sample
        } else {
            Admission::RateLimited
        }
    }

    /// Keeps reported retransmissions non-decreasing for one socket.
    ///
    /// A lower reading for the same socket is raised to the last reported
    /// value (returns true). A different socket cookie on the same 4-tuple is a
    /// new connection and restarts the sequence.
    pub fn reconcile_retransmissions(&self, counters: &mut TcpCounters) -> bool {
        let mut shard = self.shard(&counters.handle.key).lock();
        let Some(entry) = shard.get_mut(&counters.handle.key) else {
            return false;
        };

        if entry.cookie != counters.handle.cookie {
            entry.cookie = counters.handle.cookie;
            entry.last_retransmissions = counters.retransmissions;
            return false;
        }
        if counters.retransmissions < entry.last_retransmissions {
            counters.retransmissions = entry.last_retransmissions;
            return true;
        }
        entry.last_retransmissions = counters.retransmissions;
        false
    }

    /// Drops the state of a connection that no longer exists.
    pub fn forget(&self, key: &ConnectionKey) {
        self.shard(key).lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
