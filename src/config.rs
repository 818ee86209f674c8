//! Configuration for the gateway bridge
//!
//! Loaded once from a TOML file and passed by value into the components that
//! need it. Every field has a default matching a stock local deployment, so an
//! empty file is a valid configuration.

use crate::protocol::{TemplateError, Topics};
use crate::transport::mqtt::{BrokerAddress, BrokerAddressError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub general: GeneralSection,
    pub packet_forwarder: PacketForwarderSection,
    pub backend: BackendSection,
}

/// General section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralSection {
    /// 0 = panic, 1 = fatal, 2 = error, 3 = warning, 4 = info, 5 = debug
    pub log_level: u8,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self { log_level: 4 }
    }
}

/// Packet forwarder section, consumed by the UDP side of the bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PacketForwarderSection {
    /// ip:port to bind the UDP listener to
    pub udp_bind: String,
    /// Forward frames with a failed CRC check
    pub skip_crc_check: bool,
}

impl Default for PacketForwarderSection {
    fn default() -> Self {
        Self {
            udp_bind: "0.0.0.0:1700".to_string(),
            skip_crc_check: false,
        }
    }
}

/// Backend section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSection {
    pub mqtt: MqttSection,
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Broker address, e.g. `tcp://127.0.0.1:1883` or `ssl://broker:8883`
    pub server: String,
    pub username: String,
    pub password: String,
    /// Environment variable overriding `username`
    pub username_env: Option<String>,
    /// Environment variable overriding `password`
    pub password_env: Option<String>,
    /// CA certificate used to verify the broker (PEM)
    pub ca_cert: String,
    /// Client certificate (PEM)
    pub tls_cert: String,
    /// Client key (PEM)
    pub tls_key: String,
    pub uplink_topic_template: String,
    pub downlink_topic_template: String,
    pub stats_topic_template: String,
    pub ack_topic_template: String,
    /// Fixed client id; a random one is generated when unset
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    /// Time to wait for the first CONNACK at startup
    pub connect_timeout_secs: u64,
    /// Time to wait for a SUBACK or UNSUBACK
    pub ack_timeout_secs: u64,
    /// Fixed delay between resubscription attempts after a reconnect
    pub resubscribe_delay_ms: u64,
    /// Grace period for in-flight operations on close
    pub disconnect_grace_ms: u64,
    /// Capacity of the downlink hand-off channel
    pub downlink_buffer: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            server: "tcp://127.0.0.1:1883".to_string(),
            username: String::new(),
            password: String::new(),
            username_env: None,
            password_env: None,
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            uplink_topic_template: "gateway/{{ .MAC }}/rx".to_string(),
            downlink_topic_template: "gateway/{{ .MAC }}/tx".to_string(),
            stats_topic_template: "gateway/{{ .MAC }}/stats".to_string(),
            ack_topic_template: "gateway/{{ .MAC }}/ack".to_string(),
            client_id: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            ack_timeout_secs: 10,
            resubscribe_delay_ms: 1000,
            disconnect_grace_ms: 250,
            downlink_buffer: 64,
        }
    }
}

impl MqttSection {
    /// Compile the four topic templates
    pub fn topics(&self) -> Result<Topics, TemplateError> {
        Topics::parse(
            &self.uplink_topic_template,
            &self.downlink_topic_template,
            &self.stats_topic_template,
            &self.ack_topic_template,
        )
    }

    /// Username, preferring the environment variable named by `username_env`
    pub fn resolved_username(&self) -> String {
        get_env_var_optional(self.username_env.as_ref()).unwrap_or_else(|| self.username.clone())
    }

    /// Password, preferring the environment variable named by `password_env`
    pub fn resolved_password(&self) -> String {
        get_env_var_optional(self.password_env.as_ref()).unwrap_or_else(|| self.password.clone())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid topic template: {0}")]
    Template(#[from] TemplateError),
    #[error("Invalid log level {0}, expected 0-5")]
    InvalidLogLevel(u8),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching the network
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.log_level > 5 {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level));
        }

        let mqtt = &self.backend.mqtt;
        let address = BrokerAddress::parse(&mqtt.server)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        let has_tls_material =
            !(mqtt.ca_cert.is_empty() && mqtt.tls_cert.is_empty() && mqtt.tls_key.is_empty());
        if has_tls_material && !address.tls {
            return Err(ConfigError::InvalidConfig(
                BrokerAddressError::TlsWithPlainScheme(mqtt.server.clone()).to_string(),
            ));
        }
        mqtt.topics()?;

        if mqtt.tls_cert.is_empty() != mqtt.tls_key.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "tls_cert and tls_key must be set together".to_string(),
            ));
        }
        if mqtt.downlink_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "downlink_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[general]
log_level = 5

[packet_forwarder]
udp_bind = "127.0.0.1:1701"
skip_crc_check = true

[backend.mqtt]
server = "ssl://broker.example.com:8883"
username = "bridge"
password = "secret"
ca_cert = "/etc/bridge/ca.pem"
uplink_topic_template = "lora/{{ .MAC }}/up"
downlink_topic_template = "lora/{{ .MAC }}/down"
stats_topic_template = "lora/{{ .MAC }}/stats"
ack_topic_template = "lora/{{ .MAC }}/ack"
resubscribe_delay_ms = 500
"#;

        let config: BridgeConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.log_level, 5);
        assert_eq!(config.packet_forwarder.udp_bind, "127.0.0.1:1701");
        assert!(config.packet_forwarder.skip_crc_check);
        assert_eq!(config.backend.mqtt.server, "ssl://broker.example.com:8883");
        assert_eq!(config.backend.mqtt.username, "bridge");
        assert_eq!(config.backend.mqtt.ca_cert, "/etc/bridge/ca.pem");
        assert_eq!(config.backend.mqtt.downlink_topic_template, "lora/{{ .MAC }}/down");
        assert_eq!(
            config.backend.mqtt.resubscribe_delay(),
            Duration::from_millis(500)
        );
        // Unset tunables keep their defaults
        assert_eq!(config.backend.mqtt.disconnect_grace(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.general.log_level, 4);
        assert_eq!(config.backend.mqtt.server, "tcp://127.0.0.1:1883");
        assert_eq!(config.backend.mqtt.uplink_topic_template, "gateway/{{ .MAC }}/rx");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_template() {
        let mut config = BridgeConfig::default();
        config.backend.mqtt.ack_topic_template = "gateway/ack".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Template(_))));
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = BridgeConfig::default();
        config.general.log_level = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(9))
        ));
    }

    #[test]
    fn test_validate_rejects_tls_material_with_plain_scheme() {
        let mut config = BridgeConfig::default();
        config.backend.mqtt.ca_cert = "/etc/bridge/ca.pem".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(message)) if message.contains("plain scheme")
        ));

        config.backend.mqtt.server = "ssl://broker.example.com:8883".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_half_client_pair() {
        let mut config = BridgeConfig::default();
        config.backend.mqtt.server = "ssl://broker.example.com:8883".to_string();
        config.backend.mqtt.tls_cert = "/etc/bridge/client.pem".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_server() {
        let mut config = BridgeConfig::default();
        config.backend.mqtt.server = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_credentials_from_environment() {
        let section = MqttSection {
            username: "literal-user".to_string(),
            password: "literal-pass".to_string(),
            username_env: Some("GATEWAY_BRIDGE_TEST_MQTT_USER".to_string()),
            password_env: Some("GATEWAY_BRIDGE_TEST_MQTT_PASS_UNSET".to_string()),
            ..Default::default()
        };

        std::env::set_var("GATEWAY_BRIDGE_TEST_MQTT_USER", "env-user");
        assert_eq!(section.resolved_username(), "env-user");
        // Unset variable falls back to the literal value
        assert_eq!(section.resolved_password(), "literal-pass");
        std::env::remove_var("GATEWAY_BRIDGE_TEST_MQTT_USER");
        assert_eq!(section.resolved_username(), "literal-user");
    }
}
