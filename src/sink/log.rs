use crate::sink::{EmissionSink, SinkOutcome};
use crate::snapshot::MetricSnapshot;

pub const LOG_TARGET: &str = "tcp_monitor";

/// Writes one `key=value` line per snapshot through the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl EmissionSink for LogSink {
    fn accept(&self, snapshot: &MetricSnapshot) -> SinkOutcome {
        log::info!(target: LOG_TARGET, "{}", snapshot);
        SinkOutcome::Accepted
    }

    fn flush(&self) -> crate::error::Result<()> {
        log::logger().flush();
        Ok(())
    }
}
