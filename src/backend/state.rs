//! Pure connection lifecycle logic
//!
//! The backend reacts to transport events only through [`next_state`], which
//! keeps every transition in one table.

use std::fmt;
use tracing::{info, warn};

/// Connection state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; either never started or the initial attempt failed
    Disconnected,
    /// Waiting for the first broker handshake
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Link lost after being connected; the transport is retrying
    Reconnecting,
    /// Explicitly closed, terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events driving [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Backend constructed, connection initiated
    Start,
    /// Broker handshake completed
    Connected,
    /// Link to the broker lost
    ConnectionLost,
    /// Explicit close
    Close,
}

/// Determine next state after a lifecycle event (pure function)
pub fn next_state(current: ConnectionState, event: LifecycleEvent) -> ConnectionState {
    use ConnectionState as S;
    use LifecycleEvent as E;

    match (current, event) {
        (S::Closed, _) | (_, E::Close) => S::Closed,
        (_, E::Connected) => S::Connected,
        (S::Disconnected, E::Start) => S::Connecting,
        (state, E::Start) => state,
        (S::Connected | S::Reconnecting, E::ConnectionLost) => S::Reconnecting,
        (S::Connecting | S::Disconnected, E::ConnectionLost) => S::Disconnected,
    }
}

/// Check if connection state allows broker operations (pure function)
pub fn can_operate(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

/// Log connection state transition (pure logging function)
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting | ConnectionState::Disconnected, ConnectionState::Connected) => {
            info!("backend: connected to mqtt broker");
        }
        (ConnectionState::Reconnecting, ConnectionState::Connected) => {
            info!("backend: reconnected to mqtt broker");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting) => {
            warn!("backend: mqtt connection lost, transport is reconnecting");
        }
        (ConnectionState::Connecting, ConnectionState::Disconnected) => {
            warn!("backend: initial mqtt connection attempt failed");
        }
        (from, to) if from == to => {}
        _ => {
            info!(from = %from, to = %to, "backend: connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState as S;
    use LifecycleEvent as E;

    #[test]
    fn test_startup_sequence() {
        let state = next_state(S::Disconnected, E::Start);
        assert_eq!(state, S::Connecting);
        assert_eq!(next_state(state, E::Connected), S::Connected);
    }

    #[test]
    fn test_loss_and_recovery() {
        let lost = next_state(S::Connected, E::ConnectionLost);
        assert_eq!(lost, S::Reconnecting);
        // Repeated failures while retrying keep reconnecting
        assert_eq!(next_state(lost, E::ConnectionLost), S::Reconnecting);
        assert_eq!(next_state(lost, E::Connected), S::Connected);
    }

    #[test]
    fn test_initial_failure() {
        assert_eq!(next_state(S::Connecting, E::ConnectionLost), S::Disconnected);
        assert_eq!(next_state(S::Disconnected, E::ConnectionLost), S::Disconnected);
        assert_eq!(next_state(S::Disconnected, E::Connected), S::Connected);
    }

    #[test]
    fn test_start_is_idempotent() {
        assert_eq!(next_state(S::Connected, E::Start), S::Connected);
        assert_eq!(next_state(S::Reconnecting, E::Start), S::Reconnecting);
    }

    #[test]
    fn test_closed_is_terminal() {
        for state in [S::Disconnected, S::Connecting, S::Connected, S::Reconnecting] {
            assert_eq!(next_state(state, E::Close), S::Closed);
        }
        for event in [E::Start, E::Connected, E::ConnectionLost, E::Close] {
            assert_eq!(next_state(S::Closed, event), S::Closed);
        }
    }

    #[test]
    fn test_can_operate() {
        assert!(can_operate(S::Connected));
        for state in [S::Disconnected, S::Connecting, S::Reconnecting, S::Closed] {
            assert!(!can_operate(state));
        }
    }
}
