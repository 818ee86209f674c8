//! Wire-level types for the gateway bridge
//!
//! Gateway identifiers, the JSON envelopes published to and received from the
//! broker, and the per-gateway topic templates.

pub mod eui;
pub mod messages;
pub mod topics;

pub use eui::*;
pub use messages::*;
pub use topics::*;
