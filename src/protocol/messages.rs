//! JSON envelopes exchanged with the network server over MQTT
//!
//! The bridge does not interpret radio frames. PHY payloads travel as base64
//! strings and the surrounding metadata is carried as-is between the packet
//! forwarder and the broker.

use crate::protocol::Eui64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Modulation parameters of a transmission or reception
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataRate {
    /// "LORA" or "FSK"
    pub modulation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_factor: Option<u8>,
    /// Bandwidth in kHz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
    /// FSK bit rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
}

/// Reception metadata reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RxInfo {
    pub mac: Eui64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Concentrator counter in microseconds
    pub timestamp: u32,
    /// Frequency in Hz
    pub frequency: u32,
    pub channel: u8,
    pub rf_chain: u8,
    pub crc_status: i8,
    pub code_rate: String,
    pub rssi: i32,
    #[serde(rename = "loRaSNR")]
    pub lora_snr: f64,
    pub size: u32,
    pub data_rate: DataRate,
}

/// Uplink frame published on the uplink topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UplinkFrame {
    pub rx_info: RxInfo,
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
}

/// Transmission parameters for a downlink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxInfo {
    pub mac: Eui64,
    /// Send immediately instead of at `timestamp`
    #[serde(default)]
    pub immediately: bool,
    #[serde(default)]
    pub timestamp: u32,
    pub frequency: u32,
    /// Transmit power in dBm
    pub power: i32,
    pub data_rate: DataRate,
    #[serde(default)]
    pub code_rate: String,
    #[serde(default, rename = "iPol", skip_serializing_if = "Option::is_none")]
    pub i_pol: Option<bool>,
}

/// Downlink command received on the downlink topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkFrame {
    /// Correlates the frame with its [`DownlinkAck`]
    #[serde(default)]
    pub token: u16,
    pub tx_info: TxInfo,
    #[serde(with = "base64_bytes")]
    pub phy_payload: Vec<u8>,
}

/// Acknowledgement of a downlink transmission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkAck {
    pub mac: Eui64,
    pub token: u16,
    /// Empty when the frame was scheduled successfully
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Periodic gateway statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub mac: Eui64,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    pub rx_packets_received: u32,
    #[serde(rename = "rxPacketsReceivedOK")]
    pub rx_packets_received_ok: u32,
    pub tx_packets_received: u32,
    pub tx_packets_emitted: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_data: HashMap<String, Value>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
