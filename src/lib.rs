//! Gateway Bridge - broker-facing backend
//!
//! Relays LoRa gateway traffic between a local packet forwarder and an MQTT
//! broker using per-gateway topics.
//!
//! # Overview
//!
//! This crate provides:
//! - Gateway identifiers and the JSON envelopes exchanged with the broker
//! - Topic templates rendered per gateway
//! - TLS configuration from PEM files
//! - An MQTT transport with acknowledged subscribe/unsubscribe
//! - The backend: connection lifecycle, downlink subscriptions replayed on
//!   reconnect, and a channel of decoded downlink frames
//!
//! # Quick Start
//!
//! ```rust
//! use gateway_bridge::protocol::{Eui64, TopicRole, Topics};
//!
//! let topics = Topics::parse(
//!     "gateway/{{ .MAC }}/rx",
//!     "gateway/{{ .MAC }}/tx",
//!     "gateway/{{ .MAC }}/stats",
//!     "gateway/{{ .MAC }}/ack",
//! )
//! .unwrap();
//!
//! let gateway: Eui64 = "01:02:03:04:05:06:07:08".parse().unwrap();
//! assert_eq!(
//!     topics.render(TopicRole::Downlink, &gateway).unwrap(),
//!     "gateway/0102030405060708/tx"
//! );
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use backend::{Backend, BackendOptions, ConnectionState, DownlinkReceiver};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BackendError, BridgeResult};
pub use protocol::*;
pub use transport::{BrokerClient, BrokerEvent, TransportError};
