//! Hand-off of decoded downlink frames to the packet forwarder
//!
//! A bounded channel with one producer (the backend's event dispatcher) and
//! one consumer. When the consumer falls behind, delivery waits for capacity,
//! which in turn stops the dispatcher from draining broker events and pushes
//! back onto the transport.

use crate::protocol::DownlinkFrame;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Create the downlink channel
pub fn channel(capacity: usize) -> (DownlinkSender, DownlinkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (DownlinkSender { tx }, DownlinkReceiver { rx })
}

/// Decode a downlink envelope, logging and discarding malformed payloads
pub fn decode_downlink(topic: &str, payload: &[u8]) -> Option<DownlinkFrame> {
    match serde_json::from_slice::<DownlinkFrame>(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(topic = %topic, error = %e, "backend: decode downlink frame error");
            None
        }
    }
}

/// Producer side, owned by the backend's event dispatcher
#[derive(Debug, Clone)]
pub struct DownlinkSender {
    tx: mpsc::Sender<DownlinkFrame>,
}

impl DownlinkSender {
    /// Decode and hand off one broker message
    ///
    /// Returns true when a frame was delivered. Waits while the channel is
    /// full.
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(frame) = decode_downlink(topic, payload) else {
            return false;
        };

        let token = frame.token;
        if self.tx.send(frame).await.is_err() {
            warn!(topic = %topic, token, "backend: downlink receiver dropped, frame discarded");
            return false;
        }
        debug!(topic = %topic, token, "backend: downlink frame delivered");
        true
    }
}

/// Consumer side of the downlink channel
#[derive(Debug)]
pub struct DownlinkReceiver {
    rx: mpsc::Receiver<DownlinkFrame>,
}

impl DownlinkReceiver {
    /// Next frame, `None` once the backend has been torn down
    pub async fn recv(&mut self) -> Option<DownlinkFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DownlinkFrame> {
        self.rx.try_recv().ok()
    }
}
