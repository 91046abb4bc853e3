use log::{debug, info};
use parking_lot::Mutex;

use crate::error::Result;
use crate::sink::{EmissionSink, SinkOutcome};
use crate::snapshot::MetricSnapshot;

/// Publishes snapshots as JSON on a ZeroMQ PUB socket.
pub struct ZmqSink {
    // keeps the context alive as long as the socket
    _context: zmq::Context,
    socket: Mutex<zmq::Socket>,
    topic: Vec<u8>,
}

impl ZmqSink {
    /// Connects a PUB socket to `endpoint`, e.g. `tcp://collector:5556`.
    /// `high_water_mark` bounds the messages queued per peer.
    pub fn connect(endpoint: &str, topic: &str, high_water_mark: i32) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_sndhwm(high_water_mark)?;
        socket.set_linger(500)?;
        socket.connect(endpoint)?;
        info!("publishing snapshots to {} (topic {:?})", endpoint, topic);

        Ok(Self {
            _context: context,
            socket: Mutex::new(socket),
            topic: topic.as_bytes().to_vec(),
        })
    }

    /// Binds instead of connecting; collectors subscribe to us.
    pub fn bind(endpoint: &str, topic: &str, high_water_mark: i32) -> Result<Self> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_sndhwm(high_water_mark)?;
        socket.set_linger(500)?;
        socket.bind(endpoint)?;
        info!("snapshot publisher bound to {}", endpoint);

        Ok(Self {
            _context: context,
            socket: Mutex::new(socket),
            topic: topic.as_bytes().to_vec(),
        })
    }
}

impl EmissionSink for ZmqSink {
    fn accept(&self, snapshot: &MetricSnapshot) -> SinkOutcome {
        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("snapshot encoding failed: {}", e);
                return SinkOutcome::Backpressure;
            }
        };
        // another packet thread is publishing; do not wait for it
        let Some(socket) = self.socket.try_lock() else {
            return SinkOutcome::Backpressure;
        };
        let sent = socket
            .send(&self.topic[..], zmq::SNDMORE | zmq::DONTWAIT)
            .and_then(|()| socket.send(payload, zmq::DONTWAIT));
        match sent {
            Ok(()) => SinkOutcome::Accepted,
            Err(zmq::Error::EAGAIN) => SinkOutcome::Backpressure,
            Err(e) => {
                debug!("zmq publish failed: {}", e);
                SinkOutcome::Backpressure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnectionKey;
    use crate::state::table::counters;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    #[test]
    fn test_publish_without_subscribers() {
        let sink = ZmqSink::bind("inproc://tcpmon-sink-test", "tcp", 16).unwrap();
        let key = ConnectionKey::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 80),
        );
        let snapshot = MetricSnapshot::build(&counters(key, 10, 4000, 5, 1460, 2), 3, Duration::ZERO);
        // PUB drops silently when nobody listens
        assert_eq!(sink.accept(&snapshot), SinkOutcome::Accepted);
        assert!(sink.flush().is_ok());
    }
}
