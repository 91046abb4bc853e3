use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

/// 协议族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Inet,
    Inet6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::Inet,
            IpAddr::V6(_) => IpFamily::Inet6,
        }
    }

    /// Address family number as the kernel expects it.
    pub fn af(&self) -> u8 {
        match self {
            IpFamily::Inet => libc::AF_INET as u8,
            IpFamily::Inet6 => libc::AF_INET6 as u8,
        }
    }
}

/// 链路层类型, 决定 IP 头之前需要跳过多少字节
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux cooked capture (`any` pseudo interface).
    LinuxSll,
    RawIp,
}

impl LinkLayer {
    /// Maps a pcap DLT number. Unsupported link types yield `None`.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkLayer::Ethernet),
            113 => Some(LinkLayer::LinuxSll),
            12 | 101 | 228 | 229 => Some(LinkLayer::RawIp),
            _ => None,
        }
    }
}

/// Stable identifier used to join snapshots of one connection over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// 连接四元组, 以本机视角表示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl ConnectionKey {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.local.ip())
    }

    /// Identifier derived from the 4-tuple, used when the host stack
    /// exposes no socket cookie.
    pub fn fallback_id(&self) -> ConnectionId {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        ConnectionId(hasher.finish())
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
