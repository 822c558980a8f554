//! In-memory transport double
//!
//! Emulates connect/disconnect, GATT writes, and synthetic notifications so
//! the connection pool, reconnection controller, and everything above them
//! can run without an adapter. Behaviour is scripted per test: connect
//! latency, forced failures, scan results, and a responder that plays the
//! role of the peripheral firmware by answering writes with notifications.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::{DeviceAddress, DiscoveredPeripheral, NotificationHandler};
use crate::{validate_characteristic, validate_payload, Transport};

/// Produces the notification frames a write should provoke.
///
/// Arguments are the target device, the written characteristic, and the
/// payload; the return value is a list of `(characteristic, frame)` pairs
/// delivered to subscribed handlers in order.
pub type Responder =
    Arc<dyn Fn(&DeviceAddress, Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + Sync>;

#[derive(Default)]
struct MockState {
    connected: HashSet<DeviceAddress>,
    handlers: HashMap<(DeviceAddress, Uuid), NotificationHandler>,
    writes: Vec<(DeviceAddress, Uuid, Vec<u8>)>,
    connect_attempts: HashMap<DeviceAddress, u32>,
    fail_next_connects: u32,
    connect_delay: Duration,
    response_delay: Duration,
    scan_results: Vec<DiscoveredPeripheral>,
    responder: Option<Responder>,
}

/// Scriptable transport double
#[derive(Default, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency applied to every subsequent connect attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Latency between a write and the notification it provokes
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Make the next `n` connect attempts fail with a timeout
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().fail_next_connects = n;
    }

    /// Peripherals reported by the next scans
    pub fn set_scan_results(&self, results: Vec<DiscoveredPeripheral>) {
        self.state.lock().scan_results = results;
    }

    /// Install the firmware stand-in that answers writes
    pub fn set_responder(&self, responder: Responder) {
        self.state.lock().responder = Some(responder);
    }

    /// Number of transport-level connect executions for a device
    pub fn connect_attempts(&self, address: &DeviceAddress) -> u32 {
        self.state
            .lock()
            .connect_attempts
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// All recorded writes for a device, in order
    pub fn writes(&self, address: &DeviceAddress) -> Vec<(Uuid, Vec<u8>)> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(a, _, _)| a == address)
            .map(|(_, c, p)| (*c, p.clone()))
            .collect()
    }

    /// Whether a handler is currently registered
    pub fn is_subscribed(&self, address: &DeviceAddress, characteristic: Uuid) -> bool {
        self.state
            .lock()
            .handlers
            .contains_key(&(address.clone(), characteristic))
    }

    /// Deliver a synthetic notification to the subscribed handler, if any
    pub fn inject_notification(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        frame: &[u8],
    ) -> bool {
        let handler = self
            .state
            .lock()
            .handlers
            .get(&(address.clone(), characteristic))
            .cloned();
        match handler {
            Some(handler) => {
                handler(address, characteristic, frame);
                true
            }
            None => false,
        }
    }

    /// Simulate link loss without the bookkeeping of a disconnect.
    ///
    /// `is_connected` reports false afterwards, which is what the pool
    /// sweeper keys on.
    pub fn drop_link(&self, address: &DeviceAddress) {
        let mut state = self.state.lock();
        state.connected.remove(address);
        state.handlers.retain(|(a, _), _| a != address);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        address: &DeviceAddress,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state.lock();
            *state.connect_attempts.entry(address.clone()).or_insert(0) += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(TransportError::Timeout);
        }
        state.connected.insert(address.clone());
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        self.drop_link(address);
        Ok(())
    }

    async fn write(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        validate_characteristic(characteristic)?;
        validate_payload(payload)?;

        let (responder, response_delay) = {
            let mut state = self.state.lock();
            if !state.connected.contains(address) {
                return Err(TransportError::NotConnected(address.to_string()));
            }
            state
                .writes
                .push((address.clone(), characteristic, payload.to_vec()));
            (state.responder.clone(), state.response_delay)
        };

        // Play the peripheral: answer the write with notification frames.
        // Handlers run outside the state lock so they may call back in.
        if let Some(responder) = responder {
            let frames = responder(address, characteristic, payload);
            if response_delay.is_zero() {
                for (notify_char, frame) in frames {
                    self.inject_notification(address, notify_char, &frame);
                }
            } else {
                let this = self.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(response_delay).await;
                    for (notify_char, frame) in frames {
                        this.inject_notification(&address, notify_char, &frame);
                    }
                });
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        validate_characteristic(characteristic)?;
        let mut state = self.state.lock();
        if !state.connected.contains(address) {
            return Err(TransportError::NotConnected(address.to_string()));
        }
        state
            .handlers
            .insert((address.clone(), characteristic), handler);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        validate_characteristic(characteristic)?;
        self.state
            .lock()
            .handlers
            .remove(&(address.clone(), characteristic));
        Ok(())
    }

    async fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.state.lock().connected.contains(address)
    }

    async fn scan(
        &self,
        _duration: Duration,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, TransportError> {
        let results = self.state.lock().scan_results.clone();
        let (tx, rx) = mpsc::channel(results.len().max(1));
        tokio::spawn(async move {
            for r in results {
                if tx.send(r).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr() -> DeviceAddress {
        "AA:BB:CC:DD:EE:01".parse().unwrap()
    }

    #[tokio::test]
    async fn connect_write_notify_roundtrip() {
        let transport = MockTransport::new();
        let a = addr();
        let write_char = Uuid::from_u128(1);
        let notify_char = Uuid::from_u128(2);

        transport.set_responder(Arc::new(move |_, _, payload| {
            vec![(notify_char, payload.iter().rev().copied().collect())]
        }));

        transport.connect(&a, Duration::from_secs(1)).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        transport
            .subscribe(
                &a,
                notify_char,
                Arc::new(move |_, _, frame| {
                    assert_eq!(frame, [3, 2, 1]);
                    seen2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport.write(&a, write_char, &[1, 2, 3]).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(transport.writes(&a).len(), 1);
    }

    #[tokio::test]
    async fn write_requires_connection() {
        let transport = MockTransport::new();
        let err = transport
            .write(&addr(), Uuid::from_u128(1), &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn empty_payload_rejected() {
        let transport = MockTransport::new();
        transport
            .connect(&addr(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = transport
            .write(&addr(), Uuid::from_u128(1), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }
}
