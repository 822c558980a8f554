//! Transport abstraction layer for BLE battery monitor communication
//!
//! This crate provides a unified interface for talking to battery monitor
//! peripherals over Bluetooth Low Energy, plus the connection management
//! that sits on top of it:
//!
//! ```text
//! [BleTransport / MockTransport]   ← implements Transport (raw GATT I/O)
//!              |
//!      [ConnectionPool]            ← cap enforcement, dedup, state machine
//!              |
//!   [ReconnectController]          ← backoff, retry budget, re-subscribe
//!              |
//!       [device sessions]
//! ```
//!
//! The pool never reaches for the OS adapter directly; any `Transport`
//! implementation can be injected at construction, which is how the whole
//! stack above raw I/O runs against [`mock::MockTransport`] in tests.

pub mod error;
pub mod mock;
pub mod pool;
pub mod reconnect;
pub mod state;
pub mod types;

mod ble;

pub use ble::BleTransport;
pub use error::TransportError;
pub use pool::{
    AdapterExclusive, ConnectionHandle, ConnectionPool, DeviceHealth, LinkDrop, PoolConfig,
    PoolStats,
};
pub use reconnect::{BackoffPolicy, ReconnectController, ReconnectOutcome};
pub use state::{ConnectionState, ConnectionStateMachine, StateChange};
pub use types::{DeviceAddress, DiscoveredPeripheral, NotificationHandler};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The core transport trait - all backends implement this
///
/// One instance owns the host adapter and serves every peripheral; callers
/// identify the target link by [`DeviceAddress`]. Scanning and connecting
/// contend for the adapter and must not run simultaneously; the orchestrator
/// is responsible for that exclusion.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link to a peripheral.
    ///
    /// # Arguments
    /// * `address` - Canonical hardware address
    /// * `timeout` - Deadline for the whole attempt, including service discovery
    async fn connect(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Tear down a link. Idempotent: succeeds when no link exists.
    async fn disconnect(&self, address: &DeviceAddress) -> Result<(), TransportError>;

    /// Write `payload` to a characteristic on a connected peripheral.
    ///
    /// Empty payloads fail with `InvalidArgument`.
    async fn write(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribe to notifications on a characteristic.
    ///
    /// The handler is invoked in arrival order for every notification until
    /// `unsubscribe` or link loss.
    async fn subscribe(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    /// Stop notifications on a characteristic. Idempotent.
    async fn unsubscribe(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Whether the backend currently reports a live link
    async fn is_connected(&self, address: &DeviceAddress) -> bool;

    /// Scan for peripherals for `duration`.
    ///
    /// Results are delivered through the returned channel as they are
    /// collected; the channel closes when the scan window ends.
    async fn scan(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, TransportError>;
}

/// Type alias for a shared boxed transport
pub type BoxedTransport = Arc<dyn Transport>;

/// Reject empty GATT payloads before they reach a backend
pub(crate) fn validate_payload(payload: &[u8]) -> Result<(), TransportError> {
    if payload.is_empty() {
        return Err(TransportError::InvalidArgument(
            "empty GATT payload".into(),
        ));
    }
    Ok(())
}

/// Reject the nil characteristic UUID
pub(crate) fn validate_characteristic(characteristic: Uuid) -> Result<(), TransportError> {
    if characteristic.is_nil() {
        return Err(TransportError::InvalidArgument(
            "nil characteristic UUID".into(),
        ));
    }
    Ok(())
}
