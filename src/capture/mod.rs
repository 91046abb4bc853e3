//! 数据包捕获模块
//!
//! 该模块提供钩子注册、出方向数据包捕获以及手动事件源。

pub mod hook;
pub mod interface;
pub mod manual;
pub mod packet;
pub mod registry;

pub use hook::{
    EventClass, EventSource, FamilyFilter, HookId, HookSpec, PacketEvent, PacketHook, Verdict,
    PRIORITY_FIRST,
};
pub use interface::InterfaceManager;
pub use manual::ManualEventSource;
pub use packet::{CaptureCounters, PcapEventSource};
pub use registry::HookRegistry;

use serde::Deserialize;

/// 捕获方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDirection {
    Out,
    InOut,
}

/// 捕获配置
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// 接口名称
    pub interface_name: String,
    /// 是否开启混杂模式
    pub promiscuous: bool,
    /// 内核捕获缓冲区大小(字节)
    pub buffer_size: i32,
    /// 每个包保留的字节数, 只需要头部
    pub snapshot_length: i32,
    /// 读取超时(毫秒), 也是停止捕获的最长等待时间
    pub timeout_ms: i32,
    /// BPF 过滤表达式
    pub bpf_filter: String,
    pub direction: CaptureDirection,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface_name: String::new(),
            promiscuous: false,
            buffer_size: 4 * 1024 * 1024,
            snapshot_length: 128,
            timeout_ms: 100,
            bpf_filter: "tcp".to_string(),
            direction: CaptureDirection::Out,
        }
    }
}
