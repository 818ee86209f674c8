//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use gateway_bridge::backend::BackendOptions;
use gateway_bridge::config::{BridgeConfig, ConfigError};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[general]
log_level = 5

[backend.mqtt]
server = "tcp://broker.local:1883"
username = "bridge"
password = "secret"
uplink_topic_template = "lora/{{{{ .MAC }}}}/up"
downlink_topic_template = "lora/{{{{ .MAC }}}}/down"
stats_topic_template = "lora/{{{{ .MAC }}}}/stats"
ack_topic_template = "lora/{{{{ .MAC }}}}/ack"
"#
    )
    .unwrap();

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.general.log_level, 5);
    assert_eq!(config.backend.mqtt.server, "tcp://broker.local:1883");
    assert_eq!(config.backend.mqtt.username, "bridge");
    assert_eq!(
        config.backend.mqtt.downlink_topic_template,
        "lora/{{ .MAC }}/down"
    );
    assert!(config.backend.mqtt.topics().is_ok());
}

#[test]
fn test_config_loads_tunables() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[backend.mqtt]
connect_timeout_secs = 3
resubscribe_delay_ms = 750
disconnect_grace_ms = 100
downlink_buffer = 16
"#
    )
    .unwrap();

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    let options = BackendOptions::from(&config.backend.mqtt);

    assert_eq!(options.connect_timeout, Duration::from_secs(3));
    assert_eq!(options.resubscribe_delay, Duration::from_millis(750));
    assert_eq!(options.disconnect_grace, Duration::from_millis(100));
    assert_eq!(options.downlink_buffer, 16);
}

#[test]
fn test_config_fails_with_missing_file() {
    let result = BridgeConfig::load_from_file(Path::new("/nonexistent/gateway-bridge.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_invalid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[backend.mqtt\nserver = ").unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_with_wrong_field_type() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[backend.mqtt]
keep_alive_secs = "thirty"
"#
    )
    .unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_template_without_gateway_field() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[backend.mqtt]
downlink_topic_template = "gateway/tx"
"#
    )
    .unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::Template(_))));
}

#[test]
fn test_config_rejects_unknown_template_field() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[backend.mqtt]
uplink_topic_template = "gateway/{{{{ .Name }}}}/rx"
"#
    )
    .unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::Template(_))));
}

#[test]
fn test_config_rejects_unsupported_scheme() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[backend.mqtt]
server = "ws://broker.local:8080"
"#
    )
    .unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_roundtrips_through_toml() {
    let config = BridgeConfig::default();
    let text = toml::to_string_pretty(&config).unwrap();
    let parsed: BridgeConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
}
