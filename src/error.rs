//! Error types for the broker-facing backend
//!
//! Configuration errors (templates, TLS material, broker address) surface at
//! construction, before any connection is attempted. Everything else is a
//! per-call error returned to the caller of that operation.

use crate::backend::ConnectionState;
use crate::protocol::TemplateError;
use crate::transport::mqtt::{BrokerAddressError, TlsError};
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Topic template error: {0}")]
    Template(#[from] TemplateError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),

    #[error("Invalid broker address: {0}")]
    InvalidServer(#[from] BrokerAddressError),

    #[error("Broker connection failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("Broker request failed: {0}")]
    Transport(#[source] TransportError),

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend connection is closed")]
    Closed,
}

impl BackendError {
    /// Errors caused by configuration rather than the broker
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BackendError::Template(_) | BackendError::Tls(_) | BackendError::InvalidServer(_)
        )
    }

    pub fn connect_failed<S: Into<String>>(reason: S) -> Self {
        Self::ConnectFailed {
            reason: sanitize_error_message(&reason.into()),
        }
    }
}

impl From<TransportError> for BackendError {
    /// A transport shut down by `close()` reports the same error as the backend
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Shutdown => BackendError::Closed,
            other => BackendError::Transport(other),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").unwrap());

static URL_CREDENTIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<scheme>[a-z][a-z0-9+.-]*://)[^/@\s]+@").unwrap());

/// Redact credentials from broker error text before logging or returning it
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = URL_CREDENTIALS
        .replace_all(&sanitized, "${scheme}***@")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for backend operations
pub type BridgeResult<T> = Result<T, BackendError>;
