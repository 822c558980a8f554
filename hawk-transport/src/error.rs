//! Transport error types

use thiserror::Error;

use crate::state::ConnectionState;

/// Errors that can occur during transport and connection management
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// An operation was called with an empty or malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No usable Bluetooth adapter on this host
    #[error("Bluetooth adapter missing: {0}")]
    AdapterMissing(String),

    /// The peripheral is not known to the adapter
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// Operation requires a connected peripheral
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// GATT characteristic not found on the peripheral
    #[error("GATT characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    /// Connect or I/O deadline expired
    #[error("Operation timed out")]
    Timeout,

    /// The peer dropped the link mid-operation
    #[error("Peripheral disconnected")]
    Disconnected,

    /// The adapter is busy (scan in progress, link saturated)
    #[error("Adapter busy: {0}")]
    AdapterBusy(String),

    /// Admission queue for the connection cap is full
    #[error("Connection capacity exceeded: {queued} callers already parked")]
    CapacityExceeded {
        /// Number of callers parked when the request was rejected
        queued: usize,
    },

    /// A state-machine edge that the lifecycle does not allow
    #[error("Invalid connection state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// State the device was in
        from: ConnectionState,
        /// State the caller asked for
        to: ConnectionState,
    },

    /// The pool or transport is shutting down
    #[error("Transport is shutting down")]
    ShuttingDown,

    /// Backend BLE stack error
    #[error("Bluetooth error: {0}")]
    Ble(String),
}

impl TransportError {
    /// Whether the error is unrecoverable without operator intervention.
    ///
    /// Fatal errors are not retried by the reconnection controller; the
    /// device transitions to `ERROR` and stays there.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidArgument(_)
                | TransportError::AdapterMissing(_)
                | TransportError::UnknownPeripheral(_)
                | TransportError::InvalidStateTransition { .. }
                | TransportError::ShuttingDown
        )
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => {
                TransportError::UnknownPeripheral("device not found".into())
            }
            btleplug::Error::NotConnected => TransportError::NotConnected("peripheral".into()),
            btleplug::Error::TimedOut(_) => TransportError::Timeout,
            other => TransportError::Ble(other.to_string()),
        }
    }
}
