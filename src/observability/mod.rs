//! Observability for the gateway bridge
//!
//! Structured logging setup and span macros.

pub mod logging;

// Re-export for convenience
pub use logging::{
    init_default_logging, init_logging, init_logging_from_env, level_from_config, LogFormat,
};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
