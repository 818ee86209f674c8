//! Broker transport abstraction
//!
//! The backend talks to the broker through [`BrokerClient`] and learns about
//! the connection through a stream of [`BrokerEvent`]s. Keeping the seam here
//! lets the backend state machine run against [`crate::testing::MockBroker`]
//! in tests and against `rumqttc` in production.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub mod mqtt;

pub use rumqttc::QoS;

/// Connection and delivery events emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Broker accepted the connection (initial connect or reconnect)
    Connected { session_present: bool },
    /// Link to the broker was lost; the transport retries on its own
    ConnectionLost(String),
    /// Message delivered on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
}

/// Errors returned by broker requests
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request could not be queued: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No acknowledgement for {operation} within {timeout:?}")]
    AckTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("Broker rejected {0}")]
    Rejected(String),
    #[error("Connection lost before {0} was acknowledged")]
    ConnectionLost(&'static str),
    #[error("Transport is shut down")]
    Shutdown,
    #[error("Broker request failed: {0}")]
    Failed(String),
}

/// Request side of a broker connection
///
/// Subscribe and unsubscribe calls resolve once the broker acknowledged them.
/// Publishing at QoS 0 resolves once the packet is handed to the connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Subscribe to several topics with a single request
    async fn subscribe_many(&self, topics: Vec<(String, QoS)>) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Disconnect, giving in-flight operations up to `grace` to complete
    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError>;
}

/// Sleep for `delay` unless shutdown is signalled first
/// Returns true if sleep completed, false if shutdown requested
pub(crate) async fn interruptible_sleep(
    mut shutdown_rx: watch::Receiver<bool>,
    delay: Duration,
) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
