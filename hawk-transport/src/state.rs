//! Per-device connection lifecycle state machine
//!
//! Tracks the state of every peripheral the pool has ever attempted and a
//! bounded history of transitions for diagnostics. The transition table is
//! closed: edges outside it are programming errors, not runtime conditions.

use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::types::DeviceAddress;

/// Transition history entries retained per device
pub const HISTORY_LEN: usize = 32;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    /// No link, no attempt in flight
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Link established
    Connected,
    /// Operator-initiated teardown in flight
    Disconnecting,
    /// Link lost, reconnection controller armed
    Reconnecting,
    /// Terminal failure until operator or controller re-arms
    Error,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }
}

/// One recorded transition
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Device the transition belongs to
    pub address: DeviceAddress,
    /// State before the transition
    pub old: ConnectionState,
    /// State after the transition
    pub new: ConnectionState,
    /// Short human-readable cause
    pub reason: String,
    /// Wall-clock time of the transition
    pub at: SystemTime,
}

#[derive(Debug)]
struct DeviceStateEntry {
    current: ConnectionState,
    history: VecDeque<(ConnectionState, SystemTime)>,
}

impl DeviceStateEntry {
    fn new() -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LEN);
        history.push_back((ConnectionState::Disconnected, SystemTime::now()));
        Self {
            current: ConnectionState::Disconnected,
            history,
        }
    }

    fn record(&mut self, state: ConnectionState, at: SystemTime) {
        if self.history.len() >= HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((state, at));
        self.current = state;
    }
}

/// Validated state machine over all known devices.
///
/// Not internally synchronized: the connection pool owns one of these and
/// guards it with the pool lock, so maps and histories mutate atomically
/// with the handle tables.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    entries: HashMap<DeviceAddress, DeviceStateEntry>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a device; `DISCONNECTED` when never attempted
    pub fn current(&self, address: &DeviceAddress) -> ConnectionState {
        self.entries
            .get(address)
            .map(|e| e.current)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Transition history, oldest first
    pub fn history(&self, address: &DeviceAddress) -> Vec<(ConnectionState, SystemTime)> {
        self.entries
            .get(address)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply a transition, creating the device entry on first use.
    ///
    /// Returns the recorded change on success. An edge outside the lifecycle
    /// table fails with `InvalidStateTransition`.
    pub fn transition(
        &mut self,
        address: &DeviceAddress,
        new_state: ConnectionState,
        reason: &str,
    ) -> Result<StateChange, TransportError> {
        let entry = self
            .entries
            .entry(address.clone())
            .or_insert_with(DeviceStateEntry::new);

        let old = entry.current;
        if !old.can_transition_to(new_state) {
            return Err(TransportError::InvalidStateTransition {
                from: old,
                to: new_state,
            });
        }

        let at = SystemTime::now();
        entry.record(new_state, at);
        Ok(StateChange {
            address: address.clone(),
            old,
            new: new_state,
            reason: reason.to_string(),
            at,
        })
    }

    /// Drop all entries (pool shutdown)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    #[test]
    fn full_lifecycle_is_legal() {
        let mut sm = ConnectionStateMachine::new();
        let a = addr();
        for (state, reason) in [
            (ConnectionState::Connecting, "connect requested"),
            (ConnectionState::Connected, "link up"),
            (ConnectionState::Disconnecting, "operator"),
            (ConnectionState::Disconnected, "closed"),
        ] {
            sm.transition(&a, state, reason).unwrap();
        }
        assert_eq!(sm.current(&a), ConnectionState::Disconnected);
        assert_eq!(sm.history(&a).len(), 5);
    }

    #[test]
    fn illegal_edges_rejected() {
        let mut sm = ConnectionStateMachine::new();
        let a = addr();
        // DISCONNECTED -> CONNECTED skips CONNECTING
        let err = sm
            .transition(&a, ConnectionState::Connected, "bad")
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidStateTransition {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connected,
            }
        ));
        // Failed transition must not advance the state
        assert_eq!(sm.current(&a), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_path_is_legal() {
        let mut sm = ConnectionStateMachine::new();
        let a = addr();
        sm.transition(&a, ConnectionState::Connecting, "").unwrap();
        sm.transition(&a, ConnectionState::Connected, "").unwrap();
        sm.transition(&a, ConnectionState::Reconnecting, "link lost")
            .unwrap();
        sm.transition(&a, ConnectionState::Connecting, "retry")
            .unwrap();
        sm.transition(&a, ConnectionState::Error, "gave up").unwrap();
        sm.transition(&a, ConnectionState::Connecting, "operator re-arm")
            .unwrap();
    }

    #[test]
    fn history_is_bounded() {
        let mut sm = ConnectionStateMachine::new();
        let a = addr();
        for _ in 0..40 {
            sm.transition(&a, ConnectionState::Connecting, "").unwrap();
            sm.transition(&a, ConnectionState::Error, "").unwrap();
        }
        assert_eq!(sm.history(&a).len(), HISTORY_LEN);
    }

    #[test]
    fn unknown_device_reads_disconnected() {
        let sm = ConnectionStateMachine::new();
        assert_eq!(sm.current(&addr()), ConnectionState::Disconnected);
        assert!(sm.history(&addr()).is_empty());
    }
}
