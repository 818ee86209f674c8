//! Broker-facing backend of the gateway bridge
//!
//! [`Backend`] owns the broker connection. It renders per-gateway topics,
//! publishes uplink, stats and ack envelopes, keeps the set of gateways that
//! should receive downlinks, replays that set after every reconnect and hands
//! decoded downlink frames to the packet forwarder through a
//! [`DownlinkReceiver`].
//!
//! Three tasks cooperate:
//!
//! - the transport driver, which emits [`BrokerEvent`]s
//! - the event dispatcher spawned here, which drives [`ConnectionState`] and
//!   decodes deliveries
//! - at most one resubscription task, spawned on each connection
//!   acknowledgement and superseded by the next one
//!
//! # Usage
//!
//! ```rust,no_run
//! use gateway_bridge::backend::Backend;
//! use gateway_bridge::config::MqttSection;
//! use gateway_bridge::protocol::Eui64;
//!
//! # tokio_test::block_on(async {
//! let backend = Backend::connect(&MqttSection::default()).await?;
//! let gateway: Eui64 = "0102030405060708".parse()?;
//!
//! backend.subscribe_downlink(gateway).await?;
//! backend.publish_uplink(gateway, &serde_json::json!({"rssi": -42})).await?;
//!
//! if let Some(mut downlinks) = backend.take_downlink_receiver() {
//!     if let Some(frame) = downlinks.recv().await {
//!         println!("downlink token {}", frame.token);
//!     }
//! }
//! backend.close().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod downlink;
pub mod registry;
pub mod state;

pub use downlink::{DownlinkReceiver, DownlinkSender};
pub use registry::SubscriptionRegistry;
pub use state::{can_operate, next_state, ConnectionState, LifecycleEvent};

use crate::config::MqttSection;
use crate::error::{sanitize_error_message, BackendError, BridgeResult};
use crate::mqtt_span;
use crate::protocol::{DownlinkAck, Eui64, GatewayStats, TopicRole, Topics, UplinkFrame};
use crate::transport::mqtt::{build_tls_config, configure_mqtt_options, MqttTransport, ReconnectConfig};
use crate::transport::{interruptible_sleep, BrokerClient, BrokerEvent, QoS, TransportError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Tunables of a backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOptions {
    /// Time to wait for the first connection acknowledgement
    pub connect_timeout: Duration,
    /// Fixed delay between resubscription attempts
    pub resubscribe_delay: Duration,
    /// Grace period for in-flight operations on close
    pub disconnect_grace: Duration,
    /// Capacity of the downlink channel
    pub downlink_buffer: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
            disconnect_grace: Duration::from_millis(250),
            downlink_buffer: 64,
        }
    }
}

impl From<&MqttSection> for BackendOptions {
    fn from(config: &MqttSection) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            resubscribe_delay: config.resubscribe_delay(),
            disconnect_grace: config.disconnect_grace(),
            downlink_buffer: config.downlink_buffer,
        }
    }
}

/// Broker-facing backend
pub struct Backend {
    shared: Arc<Shared>,
    downlinks: std::sync::Mutex<Option<DownlinkReceiver>>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the backend handle and its tasks
struct Shared {
    client: Arc<dyn BrokerClient>,
    topics: Topics,
    gateways: SubscriptionRegistry,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    last_error: std::sync::Mutex<Option<String>>,
    resubscribe: Mutex<Option<JoinHandle<()>>>,
    options: BackendOptions,
}

impl Backend {
    /// Validate configuration, connect to the broker and wait for the first
    /// connection acknowledgement
    ///
    /// Template, TLS and address errors are returned before any connection
    /// is attempted.
    pub async fn connect(config: &MqttSection) -> BridgeResult<Self> {
        let topics = config.topics()?;
        let tls = build_tls_config(&config.ca_cert, &config.tls_cert, &config.tls_key)?;
        let mqtt_options = configure_mqtt_options(config, tls)?;

        info!(server = %config.server, "backend: connecting to mqtt broker");
        let (transport, events) = MqttTransport::start(
            mqtt_options,
            ReconnectConfig::default(),
            config.ack_timeout(),
        );

        let backend = Self::with_client(topics, transport, events, BackendOptions::from(config));
        if let Err(e) = backend.wait_until_connected().await {
            error!(server = %config.server, error = %e, "backend: could not connect to mqtt broker");
            let _ = backend.close().await;
            return Err(e);
        }
        Ok(backend)
    }

    /// Build a backend on an already started transport
    ///
    /// `events` must be the event stream of `client`. Must be called from
    /// within a Tokio runtime.
    pub fn with_client(
        topics: Topics,
        client: Arc<dyn BrokerClient>,
        events: mpsc::Receiver<BrokerEvent>,
        options: BackendOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (downlink_tx, downlink_rx) = downlink::channel(options.downlink_buffer);

        let shared = Arc::new(Shared {
            client,
            topics,
            gateways: SubscriptionRegistry::new(),
            state_tx,
            shutdown_tx,
            last_error: std::sync::Mutex::new(None),
            resubscribe: Mutex::new(None),
            options,
        });
        shared.transition(LifecycleEvent::Start);

        let dispatcher = tokio::spawn(Arc::clone(&shared).dispatch(events, downlink_tx, shutdown_rx));

        Self {
            shared,
            downlinks: std::sync::Mutex::new(Some(downlink_rx)),
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        }
    }

    /// Wait until connected, bounded by the connect timeout
    pub async fn wait_until_connected(&self) -> BridgeResult<()> {
        let mut state_rx = self.shared.state_tx.subscribe();
        let timeout = self.shared.options.connect_timeout;

        let waited = tokio::time::timeout(timeout, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => return Err(BackendError::Closed),
                    ConnectionState::Disconnected => {
                        let reason = self
                            .shared
                            .last_error()
                            .unwrap_or_else(|| "connection lost".to_string());
                        return Err(BackendError::connect_failed(reason));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(BackendError::Closed);
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(BackendError::connect_failed(format!(
                "no connection acknowledgement within {timeout:?}"
            ))),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Observe connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Gateways currently registered for downlink delivery
    pub async fn subscriptions(&self) -> BTreeSet<Eui64> {
        self.shared.gateways.snapshot().await
    }

    /// The topic templates of this backend
    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    /// Hand out the downlink receiver; only the first call returns it
    pub fn take_downlink_receiver(&self) -> Option<DownlinkReceiver> {
        self.downlinks.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Subscribe to the gateway's downlink topic, then register it
    ///
    /// The gateway is registered only after the broker acknowledged the
    /// subscription, so a reconnect never replays one the broker refused.
    #[tracing::instrument(name = "subscribe_downlink", skip(self, gateway), fields(gateway = %gateway))]
    pub async fn subscribe_downlink(&self, gateway: Eui64) -> BridgeResult<()> {
        self.shared.ensure_connected()?;
        let topic = self.shared.topics.render(TopicRole::Downlink, &gateway)?;

        info!(topic = %topic, "backend: subscribing to topic");
        self.shared.client.subscribe(&topic, QoS::AtMostOnce).await?;
        self.shared.gateways.add(gateway).await;
        Ok(())
    }

    /// Unsubscribe from the gateway's downlink topic, then unregister it
    #[tracing::instrument(name = "unsubscribe_downlink", skip(self, gateway), fields(gateway = %gateway))]
    pub async fn unsubscribe_downlink(&self, gateway: Eui64) -> BridgeResult<()> {
        self.shared.ensure_connected()?;
        let topic = self.shared.topics.render(TopicRole::Downlink, &gateway)?;

        info!(topic = %topic, "backend: unsubscribing from topic");
        self.shared.client.unsubscribe(&topic).await?;
        self.shared.gateways.remove(&gateway).await;
        Ok(())
    }

    pub async fn publish_uplink<T: Serialize + ?Sized>(
        &self,
        gateway: Eui64,
        frame: &T,
    ) -> BridgeResult<()> {
        self.publish(TopicRole::Uplink, gateway, frame).await
    }

    pub async fn publish_stats<T: Serialize + ?Sized>(
        &self,
        gateway: Eui64,
        stats: &T,
    ) -> BridgeResult<()> {
        self.publish(TopicRole::Stats, gateway, stats).await
    }

    pub async fn publish_ack<T: Serialize + ?Sized>(
        &self,
        gateway: Eui64,
        ack: &T,
    ) -> BridgeResult<()> {
        self.publish(TopicRole::Ack, gateway, ack).await
    }

    /// Publish an uplink frame on the topic of the gateway that received it
    pub async fn forward_uplink(&self, frame: &UplinkFrame) -> BridgeResult<()> {
        self.publish_uplink(frame.rx_info.mac, frame).await
    }

    /// Publish gateway statistics on the topic of the reporting gateway
    pub async fn forward_stats(&self, stats: &GatewayStats) -> BridgeResult<()> {
        self.publish_stats(stats.mac, stats).await
    }

    /// Publish a downlink acknowledgement on the topic of the acking gateway
    pub async fn forward_ack(&self, ack: &DownlinkAck) -> BridgeResult<()> {
        self.publish_ack(ack.mac, ack).await
    }

    /// JSON-encode `payload` and publish it on the role's topic, QoS 0, not retained
    #[tracing::instrument(name = "publish", skip(self, role, gateway, payload), fields(role = %role, gateway = %gateway))]
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        role: TopicRole,
        gateway: Eui64,
        payload: &T,
    ) -> BridgeResult<()> {
        self.shared.ensure_connected()?;
        let topic = self.shared.topics.render(role, &gateway)?;
        let bytes = serde_json::to_vec(payload)?;

        info!(topic = %topic, "backend: publishing packet");
        self.shared
            .client
            .publish(&topic, QoS::AtMostOnce, false, bytes)
            .await?;
        Ok(())
    }

    /// Close the backend
    ///
    /// Disconnects with the configured grace period and stops the background
    /// tasks. The downlink receiver yields `None` afterwards. Closing twice is
    /// a no-op.
    pub async fn close(&self) -> BridgeResult<()> {
        let previous = self.shared.state_tx.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return Ok(());
        }
        state::log_state_transition(previous, ConnectionState::Closed);

        self.shared.shutdown_tx.send_replace(true);
        if let Some(task) = self.shared.resubscribe.lock().await.take() {
            task.abort();
        }

        let result = self
            .shared
            .client
            .disconnect(self.shared.options.disconnect_grace)
            .await;

        if let Some(dispatcher) = self.dispatcher.lock().ok().and_then(|mut slot| slot.take()) {
            dispatcher.abort();
        }
        info!("backend: closed");
        match result {
            // Transport was already shut down
            Err(TransportError::Shutdown) => Ok(()),
            other => other.map_err(BackendError::from),
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Async disconnect is not possible here; only stop the background tasks
        self.shared.shutdown_tx.send_replace(true);
        if let Some(dispatcher) = self.dispatcher.lock().ok().and_then(|mut slot| slot.take()) {
            dispatcher.abort();
        }
        if let Ok(mut slot) = self.shared.resubscribe.try_lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Shared {
    fn ensure_connected(&self) -> BridgeResult<()> {
        let state = *self.state_tx.borrow();
        match state {
            ConnectionState::Closed => Err(BackendError::Closed),
            state if can_operate(state) => Ok(()),
            state => Err(BackendError::NotConnected { state }),
        }
    }

    /// Apply a lifecycle event, returning the resulting state
    fn transition(&self, event: LifecycleEvent) -> ConnectionState {
        let mut from = ConnectionState::Closed;
        self.state_tx.send_if_modified(|state| {
            from = *state;
            *state = next_state(from, event);
            *state != from
        });
        let to = *self.state_tx.borrow();
        state::log_state_transition(from, to);
        to
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|reason| reason.clone())
    }

    fn set_last_error(&self, reason: String) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(reason);
        }
    }

    /// Consume transport events until shutdown
    async fn dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BrokerEvent>,
        downlinks: DownlinkSender,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &downlinks).await,
                    None => {
                        debug!("backend: broker event stream ended");
                        break;
                    }
                }
            }
        }
        debug!("backend: event dispatcher stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: BrokerEvent, downlinks: &DownlinkSender) {
        match event {
            BrokerEvent::Connected { session_present } => {
                debug!(session_present, "backend: connection acknowledged");
                if self.transition(LifecycleEvent::Connected) == ConnectionState::Connected {
                    self.spawn_resubscribe().await;
                }
            }
            BrokerEvent::ConnectionLost(reason) => {
                let reason = sanitize_error_message(&reason);
                error!(error = %reason, "backend: mqtt connection error");
                self.set_last_error(reason);
                self.transition(LifecycleEvent::ConnectionLost);
            }
            BrokerEvent::Message { topic, payload } => {
                downlinks.deliver(&topic, &payload).await;
            }
        }
    }

    /// Replace any running resubscription with one for the current registry
    async fn spawn_resubscribe(self: &Arc<Self>) {
        let mut task = self.resubscribe.lock().await;
        if let Some(previous) = task.take() {
            if !previous.is_finished() {
                debug!("backend: superseding unfinished resubscription");
            }
            previous.abort();
        }

        if self.gateways.is_empty().await {
            return;
        }

        let shared = Arc::clone(self);
        *task = Some(tokio::spawn(
            async move { shared.resubscribe_loop().await }
                .instrument(mqtt_span!(operation = "resubscribe")),
        ));
    }

    /// One batched subscribe for the registry snapshot, retried with a fixed
    /// delay until it succeeds or the backend is closed
    async fn resubscribe_loop(&self) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let gateways = self.gateways.snapshot().await;
            let topics = self.downlink_topics(&gateways);
            if topics.is_empty() {
                return;
            }

            attempt += 1;
            let topic_count = topics.len();
            info!(topic_count, attempt, "backend: re-registering to gateway topics");

            match self.client.subscribe_many(topics).await {
                Ok(()) => {
                    info!(topic_count, attempt, "backend: re-registered to gateway topics");
                    return;
                }
                Err(e) => {
                    error!(topic_count, attempt, error = %e, "backend: subscribe multiple failed");
                    if !interruptible_sleep(shutdown_rx.clone(), self.options.resubscribe_delay).await {
                        return;
                    }
                }
            }
        }
    }

    fn downlink_topics(&self, gateways: &BTreeSet<Eui64>) -> Vec<(String, QoS)> {
        gateways
            .iter()
            .filter_map(|gateway| match self.topics.render(TopicRole::Downlink, gateway) {
                Ok(topic) => Some((topic, QoS::AtMostOnce)),
                Err(e) => {
                    error!(gateway = %gateway, error = %e, "backend: render downlink topic error");
                    None
                }
            })
            .collect()
    }
}
