//! MQTT transport built on `rumqttc`
//!
//! This module separates pure functions from I/O operations:
//!
//! - [`connection`] - Broker address parsing, reconnect backoff and options
//! - [`tls`] - TLS client configuration from PEM files
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - The transport itself: request side and driver task
//!
//! # Usage
//!
//! ```rust,no_run
//! use gateway_bridge::config::MqttSection;
//! use gateway_bridge::transport::mqtt::{configure_mqtt_options, MqttTransport, ReconnectConfig};
//! use gateway_bridge::transport::{BrokerClient, QoS};
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::default();
//! let options = configure_mqtt_options(&config, None)?;
//! let (transport, mut events) =
//!     MqttTransport::start(options, ReconnectConfig::default(), config.ack_timeout());
//!
//! transport.subscribe("gateway/0102030405060708/tx", QoS::AtMostOnce).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod tls;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, BrokerAddress, BrokerAddressError, ReconnectConfig};
pub use message_handler::{EventRoute, MessageHandler};
pub use tls::{build_tls_config, TlsError};
