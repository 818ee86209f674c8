//! Pure connection configuration for the MQTT transport
//!
//! Broker address parsing, reconnect backoff and construction of the
//! `rumqttc` options from the bridge configuration.

use crate::config::MqttSection;
use rumqttc::tokio_rustls::rustls::ClientConfig;
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// rumqttc rejects keep alive intervals shorter than this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Reconnection backoff for the transport driver
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds (if empty, `sustained_delay` is used)
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![100, 250, 500, 1000],
            sustained_delay: 2000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Broker address errors
#[derive(Debug, Error, PartialEq)]
pub enum BrokerAddressError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Unsupported broker URL scheme '{0}', expected tcp, mqtt, ssl, tls or mqtts")]
    UnsupportedScheme(String),
    #[error("TLS material is configured but broker URL '{0}' uses a plain scheme, use ssl, tls or mqtts")]
    TlsWithPlainScheme(String),
}

/// Parsed broker address
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    /// Scheme asks for TLS
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(server: &str) -> Result<Self, BrokerAddressError> {
        let url = Url::parse(server).map_err(|_| BrokerAddressError::InvalidUrl(server.to_string()))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => return Err(BrokerAddressError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BrokerAddressError::InvalidUrl(server.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Build `rumqttc` options from configuration and optional TLS material
pub fn configure_mqtt_options(
    config: &MqttSection,
    tls: Option<ClientConfig>,
) -> Result<MqttOptions, BrokerAddressError> {
    let address = BrokerAddress::parse(&config.server)?;

    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("gateway-bridge-{}", Uuid::new_v4().simple()));
    let mut mqtt_options = MqttOptions::new(client_id, address.host.clone(), address.port);

    let username = config.resolved_username();
    if !username.is_empty() {
        mqtt_options.set_credentials(username, config.resolved_password());
    }

    mqtt_options.set_keep_alive(config.keep_alive().max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_session(true);

    match tls {
        Some(_) if !address.tls => {
            return Err(BrokerAddressError::TlsWithPlainScheme(config.server.clone()));
        }
        Some(tls_config) => {
            mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(tls_config),
            )));
        }
        None if address.tls => {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        None => {}
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_pattern, vec![100, 250, 500, 1000]);
        assert_eq!(config.sustained_delay, 2000);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 100);
        assert_eq!(config.calculate_backoff_delay(2), 250);
        assert_eq!(config.calculate_backoff_delay(3), 500);
        assert_eq!(config.calculate_backoff_delay(4), 1000);

        // Sustained delay after pattern exhausted
        assert_eq!(config.calculate_backoff_delay(5), 2000);
        assert_eq!(config.calculate_backoff_delay(100), 2000);

        let flat = ReconnectConfig {
            backoff_pattern: Vec::new(),
            sustained_delay: 300,
        };
        assert_eq!(flat.calculate_backoff_delay(1), 300);
    }

    #[test]
    fn test_parse_plain_addresses() {
        assert_eq!(
            BrokerAddress::parse("tcp://127.0.0.1:1883").unwrap(),
            BrokerAddress {
                host: "127.0.0.1".to_string(),
                port: 1883,
                tls: false
            }
        );
        let default_port = BrokerAddress::parse("mqtt://broker.local").unwrap();
        assert_eq!(default_port.port, 1883);
        assert!(!default_port.tls);
    }

    #[test]
    fn test_parse_tls_addresses() {
        for server in ["ssl://broker:8883", "tls://broker", "mqtts://broker"] {
            let address = BrokerAddress::parse(server).unwrap();
            assert_eq!(address.host, "broker");
            assert_eq!(address.port, 8883);
            assert!(address.tls, "{server} should use TLS");
        }
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!(matches!(
            BrokerAddress::parse("invalid-url"),
            Err(BrokerAddressError::InvalidUrl(_))
        ));
        assert_eq!(
            BrokerAddress::parse("http://broker:80"),
            Err(BrokerAddressError::UnsupportedScheme("http".to_string()))
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = MqttSection {
            server: "tcp://broker.local:1884".to_string(),
            username: "bridge".to_string(),
            password: "secret".to_string(),
            client_id: Some("bridge-1".to_string()),
            keep_alive_secs: 1,
            ..Default::default()
        };

        let options = configure_mqtt_options(&config, None).unwrap();
        assert_eq!(options.client_id(), "bridge-1");
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            options.credentials(),
            Some(("bridge".to_string(), "secret".to_string()))
        );
        // Clamped to the transport minimum
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
    }

    #[test]
    fn test_generated_client_ids_are_unique() {
        let config = MqttSection::default();
        let first = configure_mqtt_options(&config, None).unwrap();
        let second = configure_mqtt_options(&config, None).unwrap();
        assert!(first.client_id().starts_with("gateway-bridge-"));
        assert_ne!(first.client_id(), second.client_id());
    }

    #[test]
    fn test_tls_material_requires_tls_scheme() {
        let tls = ClientConfig::builder()
            .with_root_certificates(rumqttc::tokio_rustls::rustls::RootCertStore::empty())
            .with_no_client_auth();

        let plain = MqttSection {
            server: "tcp://broker.local:1883".to_string(),
            ..Default::default()
        };
        assert_eq!(
            configure_mqtt_options(&plain, Some(tls.clone())).unwrap_err(),
            BrokerAddressError::TlsWithPlainScheme("tcp://broker.local:1883".to_string())
        );

        let secure = MqttSection {
            server: "ssl://broker.local:8883".to_string(),
            ..Default::default()
        };
        assert!(configure_mqtt_options(&secure, Some(tls)).is_ok());
    }

    #[test]
    fn test_configure_rejects_invalid_server() {
        let config = MqttSection {
            server: "invalid-url".to_string(),
            ..Default::default()
        };
        assert!(configure_mqtt_options(&config, None).is_err());
    }
}
