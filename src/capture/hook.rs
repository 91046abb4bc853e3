use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{IpFamily, LinkLayer};

/// Runs before every other observer of the same event class.
pub const PRIORITY_FIRST: i32 = i32::MIN;

/// Point in the host packet path a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// Locally generated packets leaving the host.
    LocalOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyFilter {
    Inet,
    Inet6,
    Any,
}

impl FamilyFilter {
    pub fn matches(&self, family: Option<IpFamily>) -> bool {
        match (self, family) {
            (FamilyFilter::Any, _) => true,
            (FamilyFilter::Inet, Some(IpFamily::Inet)) => true,
            (FamilyFilter::Inet6, Some(IpFamily::Inet6)) => true,
            _ => false,
        }
    }

    pub fn overlaps(&self, other: &FamilyFilter) -> bool {
        matches!((self, other), (FamilyFilter::Any, _) | (_, FamilyFilter::Any)) || self == other
    }
}

/// Where and in what order a hook is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSpec {
    pub event_class: EventClass,
    pub family: FamilyFilter,
    /// Lower values run earlier.
    pub priority: i32,
}

impl HookSpec {
    pub fn conflicts_with(&self, other: &HookSpec) -> bool {
        self.event_class == other.event_class
            && self.priority == other.priority
            && self.family.overlaps(&other.family)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

/// One packet seen at a hook point. Borrowed for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct PacketEvent<'a> {
    pub class: EventClass,
    pub link: LinkLayer,
    pub data: &'a [u8],
    /// Capture time since the Unix epoch.
    pub timestamp: Duration,
}

impl<'a> PacketEvent<'a> {
    pub fn outbound(link: LinkLayer, data: &'a [u8], timestamp: Duration) -> Self {
        Self {
            class: EventClass::LocalOut,
            link,
            data,
            timestamp,
        }
    }
}

/// Callback invoked inline on the packet path. Must return quickly and must
/// not block.
pub trait PacketHook: Send + Sync {
    fn on_event(&self, event: &PacketEvent<'_>) -> Verdict;
}

/// Host capability delivering packet events to registered hooks.
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    fn subscribe(&self, spec: HookSpec, hook: Arc<dyn PacketHook>) -> Result<HookId>;

    /// Withdraws a hook. When this returns, no callback of that hook is
    /// running or will run again.
    fn unsubscribe(&self, id: HookId) -> Result<()>;
}
