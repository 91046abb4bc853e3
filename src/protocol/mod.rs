//! 协议解析模块
//!
//! 把捕获到的帧解析为所属的 TCP 连接。

pub mod common;
pub mod ip;

pub use common::{ConnectionId, ConnectionKey, IpFamily, LinkLayer, IPPROTO_TCP};
pub use ip::{ip_family, outbound_tcp_key, source_address};
