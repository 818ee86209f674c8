//! Impure I/O operations for the MQTT transport
//!
//! [`MqttTransport`] owns the `rumqttc` client and a driver task polling the
//! event loop. The driver turns connection changes and deliveries into
//! [`BrokerEvent`]s and resolves pending subscribe/unsubscribe calls when the
//! matching SUBACK/UNSUBACK arrives.
//!
//! Acknowledgements are correlated in two steps. A caller registers a waiter
//! and enqueues its request while holding the client lock, so waiters are
//! queued in the same order as requests. When the driver sees the outgoing
//! packet it learns the packet id and moves the waiter into the in-flight
//! map, where the acknowledgement resolves it.

use super::connection::ReconnectConfig;
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{interruptible_sleep, BrokerClient, BrokerEvent, QoS, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, MqttOptions, SubscribeFilter};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 10;
/// Capacity of the broker event channel
const EVENT_CAPACITY: usize = 64;

type AckResult = Result<(), TransportError>;
type AckSender = oneshot::Sender<AckResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

impl AckKind {
    fn as_str(self) -> &'static str {
        match self {
            AckKind::Subscribe => "subscribe",
            AckKind::Unsubscribe => "unsubscribe",
        }
    }
}

/// Waiters for SUBACK/UNSUBACK
#[derive(Default)]
struct AckTracker {
    queued_subscribes: VecDeque<AckSender>,
    queued_unsubscribes: VecDeque<AckSender>,
    in_flight: HashMap<u16, (AckKind, AckSender)>,
}

impl AckTracker {
    fn queue_mut(&mut self, kind: AckKind) -> &mut VecDeque<AckSender> {
        match kind {
            AckKind::Subscribe => &mut self.queued_subscribes,
            AckKind::Unsubscribe => &mut self.queued_unsubscribes,
        }
    }

    fn enqueue(&mut self, kind: AckKind) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.queue_mut(kind).push_back(tx);
        rx
    }

    /// Drop the most recent waiter after its request could not be queued
    fn cancel_last(&mut self, kind: AckKind) {
        self.queue_mut(kind).pop_back();
    }

    fn sent(&mut self, kind: AckKind, packet_id: u16) {
        match self.queue_mut(kind).pop_front() {
            Some(tx) => {
                self.in_flight.insert(packet_id, (kind, tx));
            }
            None => debug!(packet_id, "Untracked {} sent", kind.as_str()),
        }
    }

    fn acknowledge(&mut self, packet_id: u16, result: AckResult) {
        match self.in_flight.remove(&packet_id) {
            Some((_, tx)) => {
                // Waiter may have timed out already
                let _ = tx.send(result);
            }
            None => debug!(packet_id, "Acknowledgement without waiter"),
        }
    }

    /// Fail every waiter, returning how many were pending
    ///
    /// rumqttc does not resend SUBSCRIBE/UNSUBSCRIBE after a reconnect, so
    /// their packet ids are free for reuse once dropped here.
    fn fail_all(&mut self) -> usize {
        let mut failed = 0;
        for kind in [AckKind::Subscribe, AckKind::Unsubscribe] {
            for tx in self.queue_mut(kind).drain(..) {
                let _ = tx.send(Err(TransportError::ConnectionLost(kind.as_str())));
                failed += 1;
            }
        }
        for (_, (kind, tx)) in self.in_flight.drain() {
            let _ = tx.send(Err(TransportError::ConnectionLost(kind.as_str())));
            failed += 1;
        }
        failed
    }
}

/// Broker transport over `rumqttc`
pub struct MqttTransport {
    client: Mutex<AsyncClient>,
    acks: Arc<Mutex<AckTracker>>,
    ack_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    flushed_rx: watch::Receiver<bool>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create the client and spawn the driver task
    ///
    /// The connection is established by the driver; the first
    /// [`BrokerEvent::Connected`] on the returned receiver confirms it.
    pub fn start(
        options: MqttOptions,
        reconnect: ReconnectConfig,
        ack_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<BrokerEvent>) {
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (flushed_tx, flushed_rx) = watch::channel(false);
        let acks = Arc::new(Mutex::new(AckTracker::default()));

        let driver = EventLoopDriver {
            event_loop,
            acks: acks.clone(),
            events_tx,
            reconnect,
            shutdown_rx,
            flushed_tx,
        };
        let handle = tokio::spawn(driver.run());

        let transport = Arc::new(Self {
            client: Mutex::new(client),
            acks,
            ack_timeout,
            shutdown_tx,
            flushed_rx,
            driver: std::sync::Mutex::new(Some(handle)),
        });
        (transport, events_rx)
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if *self.shutdown_tx.borrow() {
            return Err(TransportError::Shutdown);
        }
        Ok(())
    }

    async fn wait_for_ack(&self, kind: AckKind, ack: oneshot::Receiver<AckResult>) -> AckResult {
        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost(kind.as_str())),
            Err(_) => {
                warn!(timeout = ?self.ack_timeout, "No acknowledgement for {}", kind.as_str());
                Err(TransportError::AckTimeout {
                    operation: kind.as_str(),
                    timeout: self.ack_timeout,
                })
            }
        }
    }

    fn stop_driver(&self) {
        self.shutdown_tx.send_replace(true);
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }
}

fn request_error(error: rumqttc::ClientError) -> TransportError {
    TransportError::Request(Box::new(error))
}

#[async_trait]
impl BrokerClient for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let client = self.client.lock().await;
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(request_error)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.subscribe_many(vec![(topic.to_string(), qos)]).await
    }

    async fn subscribe_many(&self, topics: Vec<(String, QoS)>) -> Result<(), TransportError> {
        self.ensure_running()?;
        let filters: Vec<SubscribeFilter> = topics
            .into_iter()
            .map(|(path, qos)| SubscribeFilter::new(path, qos))
            .collect();

        let ack = {
            let client = self.client.lock().await;
            let ack = self.acks.lock().await.enqueue(AckKind::Subscribe);
            if let Err(e) = client.subscribe_many(filters).await {
                self.acks.lock().await.cancel_last(AckKind::Subscribe);
                return Err(request_error(e));
            }
            ack
        };
        self.wait_for_ack(AckKind::Subscribe, ack).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_running()?;
        let ack = {
            let client = self.client.lock().await;
            let ack = self.acks.lock().await.enqueue(AckKind::Unsubscribe);
            if let Err(e) = client.unsubscribe(topic).await {
                self.acks.lock().await.cancel_last(AckKind::Unsubscribe);
                return Err(request_error(e));
            }
            ack
        };
        self.wait_for_ack(AckKind::Unsubscribe, ack).await
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        if *self.shutdown_tx.borrow() {
            return Ok(());
        }

        // DISCONNECT is queued behind requests already handed to rumqttc
        let queued = tokio::time::timeout(grace, async {
            let client = self.client.lock().await;
            client.disconnect().await
        })
        .await;
        match queued {
            Ok(Ok(())) => {
                let mut flushed = self.flushed_rx.clone();
                let wait_flushed = async move {
                    while !*flushed.borrow_and_update() {
                        if flushed.changed().await.is_err() {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(grace, wait_flushed).await.is_err() {
                    debug!(grace = ?grace, "DISCONNECT not flushed within grace period");
                }
            }
            Ok(Err(e)) => debug!(error = %e, "Could not queue DISCONNECT"),
            Err(_) => debug!(grace = ?grace, "Request queue full, dropping DISCONNECT"),
        }

        self.stop_driver();
        let failed = self.acks.lock().await.fail_all();
        if failed > 0 {
            warn!(failed_requests = failed, "Disconnected with unacknowledged requests");
        }
        info!("MQTT transport shut down");
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Async disconnect is not possible here; only stop the driver task
        self.stop_driver();
    }
}

/// Event loop driver task
struct EventLoopDriver {
    event_loop: EventLoop,
    acks: Arc<Mutex<AckTracker>>,
    events_tx: mpsc::Sender<BrokerEvent>,
    reconnect: ReconnectConfig,
    shutdown_rx: watch::Receiver<bool>,
    flushed_tx: watch::Sender<bool>,
}

impl EventLoopDriver {
    async fn run(mut self) {
        info!("Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                // Check for shutdown signal first (higher priority)
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                event_result = self.event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut reconnect_attempts).await
                        }
                        Err(e) => self.handle_event_loop_error(e, &mut reconnect_attempts).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        self.acks.lock().await.fail_all();
        self.flushed_tx.send_replace(true);
        info!("MQTT event loop stopped");
    }

    /// Returns true to continue loop, false to break
    async fn process_event_route(&mut self, route: EventRoute, reconnect_attempts: &mut u32) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                info!(session_present, "MQTT connection acknowledged");
                *reconnect_attempts = 0;
                self.forward(BrokerEvent::Connected { session_present }).await
            }
            EventRoute::MessageReceived { topic, payload } => {
                trace!(topic = %topic, bytes = payload.len(), "MQTT message received");
                self.forward(BrokerEvent::Message { topic, payload }).await
            }
            EventRoute::SubscribeSent { packet_id } => {
                self.acks.lock().await.sent(AckKind::Subscribe, packet_id);
                true
            }
            EventRoute::UnsubscribeSent { packet_id } => {
                self.acks.lock().await.sent(AckKind::Unsubscribe, packet_id);
                true
            }
            EventRoute::SubscriptionAcknowledged { packet_id, accepted } => {
                let result = if accepted {
                    Ok(())
                } else {
                    warn!(packet_id, "Broker refused subscription");
                    Err(TransportError::Rejected(format!(
                        "subscription with packet id {packet_id}"
                    )))
                };
                self.acks.lock().await.acknowledge(packet_id, result);
                true
            }
            EventRoute::UnsubscribeAcknowledged { packet_id } => {
                self.acks.lock().await.acknowledge(packet_id, Ok(()));
                true
            }
            EventRoute::DisconnectSent => {
                info!("MQTT DISCONNECT sent");
                false
            }
            EventRoute::Disconnected => {
                warn!("MQTT broker sent DISCONNECT");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(event = %event, "MQTT infrastructure event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Fail pending waiters, report the loss and back off before the next poll
    async fn handle_event_loop_error(
        &mut self,
        error: ConnectionError,
        reconnect_attempts: &mut u32,
    ) -> bool {
        let failed = self.acks.lock().await.fail_all();
        error!(error = %error, failed_requests = failed, "MQTT event loop error");

        if !self.forward(BrokerEvent::ConnectionLost(error.to_string())).await {
            return false;
        }

        *reconnect_attempts += 1;
        let delay_ms = self.reconnect.calculate_backoff_delay(*reconnect_attempts);
        info!(
            attempt = *reconnect_attempts,
            delay_ms, "Reconnecting to MQTT broker"
        );
        interruptible_sleep(self.shutdown_rx.clone(), Duration::from_millis(delay_ms)).await
    }

    async fn forward(&mut self, event: BrokerEvent) -> bool {
        if self.events_tx.send(event).await.is_err() {
            warn!("Broker event receiver dropped, stopping MQTT event loop");
            return false;
        }
        true
    }
}
