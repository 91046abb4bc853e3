use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::Path;

use crate::capture::{CaptureConfig, CaptureDirection};
use crate::error::{MonitorError, Result};
use crate::monitor::MonitorConfig;

/// 环境变量前缀, 例如 `TCPMON__MONITOR__PRIORITY=0`
pub const ENV_PREFIX: &str = "TCPMON";

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<String>,

    /// 要监听的网络接口名称
    #[arg(short, long)]
    pub interface: Option<String>,

    /// 快照输出方式
    #[arg(short, long, value_enum)]
    pub sink: Option<SinkKind>,

    /// 日志级别
    #[arg(short, long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// 默认日志级别
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// 从 YAML 文件加载配置, 环境变量可以覆盖文件中的值
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(Path::new(path)))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Configuration for running with command line arguments only.
    pub fn for_interface(name: &str) -> Self {
        Self {
            interface: InterfaceConfig {
                name: name.to_string(),
                ..InterfaceConfig::default()
            },
            monitor: MonitorConfig::default(),
            sink: SinkConfig::default(),
            log_level: default_log_level(),
        }
    }

    /// Command line flags win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(name) = &args.interface {
            self.interface.name = name.clone();
        }
        if let Some(kind) = args.sink {
            self.sink.kind = kind;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.interface.validate()?;
        self.monitor.validate()?;
        self.sink.validate()?;
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(MonitorError::Config(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InterfaceConfig {
    pub name: String,
    pub promiscuous: bool,
    pub buffer_size: usize,
    pub snapshot_length: usize,
    pub timeout_ms: u32,
    pub bpf_filter: String,
    pub direction: CaptureDirection,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            name: String::new(),
            promiscuous: capture.promiscuous,
            buffer_size: capture.buffer_size as usize,
            snapshot_length: capture.snapshot_length as usize,
            timeout_ms: capture.timeout_ms as u32,
            bpf_filter: capture.bpf_filter,
            direction: capture.direction,
        }
    }
}

impl InterfaceConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MonitorError::Config("interface.name is required".to_string()));
        }
        if self.buffer_size == 0 || self.snapshot_length == 0 || self.timeout_ms == 0 {
            return Err(MonitorError::Config(
                "interface buffer_size, snapshot_length and timeout_ms must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> Result<CaptureConfig> {
        let to_i32 = |field: &str, value: u64| {
            i32::try_from(value)
                .map_err(|_| MonitorError::Config(format!("interface.{} is too large", field)))
        };
        Ok(CaptureConfig {
            interface_name: self.name.clone(),
            promiscuous: self.promiscuous,
            buffer_size: to_i32("buffer_size", self.buffer_size as u64)?,
            snapshot_length: to_i32("snapshot_length", self.snapshot_length as u64)?,
            timeout_ms: to_i32("timeout_ms", u64::from(self.timeout_ms))?,
            bpf_filter: self.bpf_filter.clone(),
            direction: self.direction,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// 写入日志
    Log,
    /// JSON lines, 写入文件或标准输出
    Json,
    /// ZeroMQ PUB
    Zmq,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// json 输出文件, 缺省为标准输出
    pub path: Option<String>,
    /// zmq 端点
    pub endpoint: Option<String>,
    /// bind instead of connect
    pub bind: bool,
    pub topic: String,
    pub queue_size: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            path: None,
            endpoint: None,
            bind: false,
            topic: "tcp_monitor".to_string(),
            queue_size: 1024,
        }
    }
}

impl SinkConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(MonitorError::Config("sink.queue_size must be positive".to_string()));
        }
        if self.kind == SinkKind::Zmq && self.endpoint.as_deref().unwrap_or("").is_empty() {
            return Err(MonitorError::Config(
                "sink.endpoint is required for the zmq sink".to_string(),
            ));
        }
        Ok(())
    }
}
