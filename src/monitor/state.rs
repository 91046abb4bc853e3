use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    Initial,
    Running,
    Stopped,
    Failed(String),
}

impl MonitorState {
    pub fn is_active(&self) -> bool {
        matches!(self, MonitorState::Running)
    }
}

#[derive(Debug)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub started_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl MonitorStatus {
    pub fn new() -> Self {
        Self {
            state: MonitorState::Initial,
            started_at: None,
            last_error: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        match (&self.state, self.started_at) {
            (MonitorState::Running, Some(started)) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self::new()
    }
}
