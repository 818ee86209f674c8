//! Mock implementations for testing
//!
//! [`MockBroker`] implements [`BrokerClient`] in memory: it records every call
//! with the (Tokio) time it was made and fails a scripted number of calls per
//! operation. Like the real transport it refuses requests once disconnected.
//! Paired with an event sender it simulates connects, connection
//! losses and deliveries without a broker.

use crate::backend::{Backend, BackendOptions};
use crate::protocol::Topics;
use crate::transport::{BrokerClient, BrokerEvent, QoS, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

/// Broker operations, used to script failures and filter calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Publish,
    Subscribe,
    SubscribeMany,
    Unsubscribe,
    Disconnect,
}

/// A call made against the mock broker
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Publish {
        topic: String,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    SubscribeMany {
        topics: Vec<(String, QoS)>,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect {
        grace: Duration,
    },
}

impl BrokerCall {
    pub fn operation(&self) -> Operation {
        match self {
            BrokerCall::Publish { .. } => Operation::Publish,
            BrokerCall::Subscribe { .. } => Operation::Subscribe,
            BrokerCall::SubscribeMany { .. } => Operation::SubscribeMany,
            BrokerCall::Unsubscribe { .. } => Operation::Unsubscribe,
            BrokerCall::Disconnect { .. } => Operation::Disconnect,
        }
    }
}

/// A call with its outcome
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub call: BrokerCall,
    pub accepted: bool,
}

/// In-memory broker for testing
#[derive(Debug, Default)]
pub struct MockBroker {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<Operation, u32>>,
    recorded: Notify,
    shut_down: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` calls of `operation`
    pub async fn fail_next(&self, operation: Operation, count: u32) {
        self.failures.lock().await.insert(operation, count);
    }

    /// All calls, accepted or not
    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|recorded| recorded.call.clone())
            .collect()
    }

    pub async fn recorded(&self, operation: Operation) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|recorded| recorded.call.operation() == operation)
            .cloned()
            .collect()
    }

    pub async fn accepted_count(&self, operation: Operation) -> usize {
        self.recorded(operation)
            .await
            .iter()
            .filter(|recorded| recorded.accepted)
            .count()
    }

    pub async fn clear_history(&self) {
        self.calls.lock().await.clear();
    }

    /// Wait until at least `count` calls of `operation` were accepted
    pub async fn wait_for_accepted(
        &self,
        operation: Operation,
        count: usize,
        timeout: Duration,
    ) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let recorded = self.recorded.notified();
                if self.accepted_count(operation).await >= count {
                    return;
                }
                recorded.await;
            }
        })
        .await
        .is_ok()
    }

    /// True once `disconnect` was called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn record(&self, call: BrokerCall) -> Result<(), TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::Shutdown);
        }
        let operation = call.operation();
        let accepted = {
            let mut failures = self.failures.lock().await;
            match failures.get_mut(&operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    false
                }
                _ => true,
            }
        };

        self.calls.lock().await.push(RecordedCall {
            at: Instant::now(),
            call,
            accepted,
        });
        self.recorded.notify_waiters();

        if accepted {
            Ok(())
        } else {
            Err(TransportError::Failed(format!(
                "scripted {operation:?} failure"
            )))
        }
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.record(BrokerCall::Publish {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        })
        .await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(BrokerCall::Subscribe {
            topic: topic.to_string(),
            qos,
        })
        .await
    }

    async fn subscribe_many(&self, topics: Vec<(String, QoS)>) -> Result<(), TransportError> {
        self.record(BrokerCall::SubscribeMany { topics }).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(BrokerCall::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        let result = self.record(BrokerCall::Disconnect { grace }).await;
        self.shut_down.store(true, Ordering::SeqCst);
        result
    }
}

/// Topics used throughout the tests
pub fn test_topics() -> Topics {
    Topics::parse(
        "gateway/{{ .MAC }}/rx",
        "gateway/{{ .MAC }}/tx",
        "gateway/{{ .MAC }}/stats",
        "gateway/{{ .MAC }}/ack",
    )
    .expect("test topic templates are valid")
}

/// A backend wired to a [`MockBroker`]
pub struct MockBackend {
    pub backend: Backend,
    pub broker: Arc<MockBroker>,
    pub events: mpsc::Sender<BrokerEvent>,
}

impl MockBackend {
    /// Backend in the Connecting state; nothing has been acknowledged yet
    pub fn new(options: BackendOptions) -> Self {
        let broker = MockBroker::new();
        let (events, events_rx) = mpsc::channel(16);
        let backend = Backend::with_client(test_topics(), broker.clone(), events_rx, options);
        Self {
            backend,
            broker,
            events,
        }
    }

    /// Backend that already received its first connection acknowledgement
    pub async fn connected(options: BackendOptions) -> Self {
        let mock = Self::new(options);
        mock.simulate_connect().await;
        mock.backend
            .wait_until_connected()
            .await
            .expect("mock backend connects");
        mock
    }

    pub async fn simulate_connect(&self) {
        self.send(BrokerEvent::Connected {
            session_present: false,
        })
        .await;
    }

    pub async fn simulate_connection_lost(&self, reason: &str) {
        self.send(BrokerEvent::ConnectionLost(reason.to_string()))
            .await;
    }

    pub async fn simulate_message(&self, topic: &str, payload: &[u8]) {
        self.send(BrokerEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
        .await;
    }

    async fn send(&self, event: BrokerEvent) {
        // The dispatcher stops receiving once the backend is closed
        let _ = self.events.send(event).await;
    }
}
