//! Gateway identifier (EUI-64)
//!
//! Gateways are addressed by their 8-byte EUI. The canonical text form is 16
//! lowercase hex digits without separators; that is what topic templates and
//! JSON envelopes carry.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 8-byte gateway identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<[u8; 8]> for Eui64 {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl From<u64> for Eui64 {
    fn from(value: u64) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors parsing an EUI-64 from text
#[derive(Debug, Error, PartialEq)]
pub enum EuiParseError {
    #[error("EUI64 must be 8 bytes (16 hex digits), got {0} digits")]
    InvalidLength(usize),
    #[error("EUI64 contains invalid hex character: '{0}'")]
    InvalidChar(char),
}

impl FromStr for Eui64 {
    type Err = EuiParseError;

    /// Accepts `0102030405060708`, `01:02:03:04:05:06:07:08` and
    /// `01-02-03-04-05-06-07-08`, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .map(|c| {
                c.to_digit(16)
                    .map(|d| d as u8)
                    .ok_or(EuiParseError::InvalidChar(c))
            })
            .collect::<Result<_, _>>()?;

        if digits.len() != 16 {
            return Err(EuiParseError::InvalidLength(digits.len()));
        }

        let mut bytes = [0u8; 8];
        for (i, pair) in digits.chunks(2).enumerate() {
            bytes[i] = (pair[0] << 4) | pair[1];
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
