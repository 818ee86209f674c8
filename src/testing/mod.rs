//! Testing utilities and mock implementations
//!
//! This module provides an in-memory broker for testing the backend without
//! an MQTT broker.

pub mod mocks;

pub use mocks::*;
