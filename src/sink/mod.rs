//! Emission sinks.
//!
//! A sink receives each snapshot synchronously on the packet path. `accept`
//! must return promptly; a sink that cannot take the record right now says
//! so with [`SinkOutcome::Backpressure`] and the record is dropped and counted.

pub mod channel;
pub mod log;
pub mod zmq;

pub use self::channel::{ChannelSink, JsonLinesWriter};
pub use self::log::LogSink;
pub use self::zmq::ZmqSink;

use crate::error::Result;
use crate::snapshot::MetricSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Accepted,
    Backpressure,
}

#[cfg_attr(test, mockall::automock)]
pub trait EmissionSink: Send + Sync {
    fn accept(&self, snapshot: &MetricSnapshot) -> SinkOutcome;

    /// Pushes out anything buffered. Called once at shutdown.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
