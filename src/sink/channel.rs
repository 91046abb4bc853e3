use log::{debug, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::error::Result;
use crate::sink::{EmissionSink, SinkOutcome};
use crate::snapshot::MetricSnapshot;

/// Hands snapshots to an async consumer through a bounded channel.
///
/// `try_send` never waits, so a full channel turns into backpressure.
pub struct ChannelSink {
    tx: mpsc::Sender<MetricSnapshot>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EmissionSink for ChannelSink {
    fn accept(&self, snapshot: &MetricSnapshot) -> SinkOutcome {
        match self.tx.try_send(snapshot.clone()) {
            Ok(()) => SinkOutcome::Accepted,
            Err(TrySendError::Full(_)) => SinkOutcome::Backpressure,
            Err(TrySendError::Closed(_)) => {
                debug!("snapshot channel closed");
                SinkOutcome::Backpressure
            }
        }
    }
}

/// Drains a snapshot channel into newline-delimited JSON.
pub struct JsonLinesWriter<W> {
    rx: mpsc::Receiver<MetricSnapshot>,
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> JsonLinesWriter<W> {
    pub fn new(rx: mpsc::Receiver<MetricSnapshot>, writer: W) -> Self {
        Self {
            rx,
            writer: BufWriter::new(writer),
        }
    }

    /// Runs until every sender is gone. Returns the number of records written.
    pub async fn run(mut self) -> Result<u64> {
        let mut written = 0u64;
        while let Some(snapshot) = self.rx.recv().await {
            self.write_record(&snapshot).await?;
            written += 1;

            // write whatever is already queued, then flush once
            loop {
                match self.rx.try_recv() {
                    Ok(snapshot) => {
                        self.write_record(&snapshot).await?;
                        written += 1;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            if let Err(e) = self.writer.flush().await {
                warn!("flushing snapshot output failed: {}", e);
                return Err(e.into());
            }
        }
        self.writer.flush().await?;
        Ok(written)
    }

    async fn write_record(&mut self, snapshot: &MetricSnapshot) -> Result<()> {
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }
}
