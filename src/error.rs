use std::io;
use thiserror::Error;

/// Why a hook could not be installed or withdrawn.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("priority {priority} already taken by hook {existing} for the same event class")]
    PriorityConflict { priority: i32, existing: u64 },

    #[error("monitor is already registered")]
    AlreadyActive,

    #[error("unknown hook id {0}")]
    UnknownHook(u64),

    #[error("event source unavailable: {0}")]
    Source(String),
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Packet capture error: {0}")]
    Capture(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error {0}")]
    Io(io::ErrorKind),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<pcap::Error> for MonitorError {
    fn from(err: pcap::Error) -> Self {
        match err {
            pcap::Error::IoError(e) => Self::Io(e),
            _ => Self::Capture(err.to_string()),
        }
    }
}

impl From<io::Error> for MonitorError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => MonitorError::PermissionDenied(err.to_string()),
            kind => MonitorError::Io(kind),
        }
    }
}

impl From<serde_yaml::Error> for MonitorError {
    fn from(err: serde_yaml::Error) -> Self {
        MonitorError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for MonitorError {
    fn from(err: config::ConfigError) -> Self {
        MonitorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Sink(err.to_string())
    }
}

impl From<zmq::Error> for MonitorError {
    fn from(err: zmq::Error) -> Self {
        MonitorError::Sink(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
