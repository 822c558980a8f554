//! Connection pool
//!
//! Owns every live link to a peripheral and the per-device state machine.
//! Enforces the adapter's concurrency cap with a bounded admission queue,
//! deduplicates concurrent connect attempts for the same address, and sweeps
//! links whose transport has silently died.
//!
//! Cap accounting is the semaphore permit embedded in each handle: a slot is
//! occupied from the moment a connect attempt is admitted until the last
//! clone of the resulting handle drops. A device backing off between
//! reconnect attempts holds no slot, so one unreachable peripheral cannot
//! starve the rest of the fleet.
//!
//! A single lock guards the handle table, the pending-attempt table, and the
//! state machine, so observers always see a consistent picture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{
    broadcast, mpsc, watch, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore,
    TryAcquireError,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::state::{ConnectionState, ConnectionStateMachine, StateChange};
use crate::types::{DeviceAddress, NotificationHandler};
use crate::BoxedTransport;

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneously open links (cap N). BLE adapters usually take 1.
    pub max_connections: usize,
    /// Deadline for a single transport connect attempt
    pub connect_timeout: Duration,
    /// Callers parked waiting for a slot before new requests are rejected
    pub queue_bound: usize,
    /// Whether swept links arm the reconnection controller
    pub auto_reconnect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            connect_timeout: Duration::from_secs(30),
            queue_bound: 64,
            auto_reconnect: true,
        }
    }
}

/// Pool-wide counters for the health surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles currently held
    pub active: usize,
    /// Handles whose device state is `CONNECTED`
    pub connected: usize,
    /// Addresses with a connect attempt in flight
    pub pending: usize,
    /// Callers parked on the admission queue
    pub queued: usize,
    /// The configured cap
    pub capacity: usize,
}

/// Per-device health snapshot
#[derive(Debug, Clone)]
pub struct DeviceHealth {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Transition history, oldest first
    pub history: Vec<(ConnectionState, SystemTime)>,
    /// Characteristics with live subscriptions
    pub subscriptions: Vec<Uuid>,
    /// When the current link came up, if one exists
    pub connected_at: Option<SystemTime>,
}

/// A link the sweeper found dead, with everything needed to rebuild it
pub struct LinkDrop {
    /// The device that lost its link
    pub address: DeviceAddress,
    /// Subscriptions active at drop time, to re-install after reconnect
    pub subscriptions: Vec<(Uuid, NotificationHandler)>,
}

impl std::fmt::Debug for LinkDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkDrop")
            .field("address", &self.address)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

struct HandleInner {
    address: DeviceAddress,
    connected_at: SystemTime,
    subscriptions: Mutex<HashMap<Uuid, NotificationHandler>>,
    // Slot is released when the last clone of the handle drops
    _permit: OwnedSemaphorePermit,
}

/// Shared reference to one live link.
///
/// All concurrent `get_or_connect` callers for an address receive clones of
/// the same handle; [`ConnectionHandle::same_as`] makes that observable.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn address(&self) -> &DeviceAddress {
        &self.inner.address
    }

    pub fn connected_at(&self) -> SystemTime {
        self.inner.connected_at
    }

    /// Characteristics with a registered notification handler
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.inner.subscriptions.lock().keys().copied().collect()
    }

    /// Whether two handles refer to the same underlying link
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("address", &self.inner.address)
            .finish()
    }
}

type PendingResult = Option<Result<ConnectionHandle, TransportError>>;

struct PoolInner {
    active: HashMap<DeviceAddress, ConnectionHandle>,
    pending: HashMap<DeviceAddress, watch::Receiver<PendingResult>>,
    machine: ConnectionStateMachine,
}

/// Cap-enforcing owner of all peripheral links
pub struct ConnectionPool {
    transport: BoxedTransport,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    admission: Arc<Semaphore>,
    queued: AtomicUsize,
    // Scan and connect contend for the adapter; connects take the read
    // side, a scan takes the write side
    adapter_gate: Arc<RwLock<()>>,
    changes: broadcast::Sender<StateChange>,
}

/// Exclusive adapter access for the duration of a scan.
///
/// While held, no connect attempt touches the adapter; established links
/// are left alone.
pub struct AdapterExclusive {
    _guard: OwnedRwLockWriteGuard<()>,
}

enum ConnectPlan {
    Existing(ConnectionHandle),
    Wait(watch::Receiver<PendingResult>),
    Attempt(watch::Sender<PendingResult>),
}

impl ConnectionPool {
    pub fn new(transport: BoxedTransport, config: PoolConfig) -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            admission: Arc::new(Semaphore::new(config.max_connections)),
            config,
            inner: Mutex::new(PoolInner {
                active: HashMap::new(),
                pending: HashMap::new(),
                machine: ConnectionStateMachine::new(),
            }),
            queued: AtomicUsize::new(0),
            adapter_gate: Arc::new(RwLock::new(())),
            changes,
        })
    }

    /// The injected transport, for collaborators that need raw scan access
    pub fn transport(&self) -> &BoxedTransport {
        &self.transport
    }

    /// State transitions as they happen, for event fan-out
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Return the existing handle for `address` or establish a new link.
    ///
    /// Race-free: when several callers ask for the same address, exactly one
    /// transport connect executes and every caller resolves to the same
    /// handle (or the same error). Callers beyond the cap park on a bounded
    /// FIFO; the newest is rejected with `CapacityExceeded` once
    /// `queue_bound` callers are already parked.
    pub async fn get_or_connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<ConnectionHandle, TransportError> {
        loop {
            let plan = {
                let mut inner = self.inner.lock();
                if let Some(handle) = inner.active.get(address) {
                    ConnectPlan::Existing(handle.clone())
                } else if let Some(rx) = inner.pending.get(address) {
                    ConnectPlan::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    inner.pending.insert(address.clone(), rx);
                    ConnectPlan::Attempt(tx)
                }
            };

            match plan {
                ConnectPlan::Existing(handle) => return Ok(handle),
                ConnectPlan::Wait(mut rx) => {
                    debug!("Joining in-flight connect attempt for {}", address);
                    loop {
                        if let Some(result) = rx.borrow().clone() {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // Attempt owner vanished without publishing; retry
                            break;
                        }
                    }
                }
                ConnectPlan::Attempt(tx) => {
                    let result = self.attempt_connect(address).await;
                    {
                        let mut inner = self.inner.lock();
                        inner.pending.remove(address);
                        if let Ok(handle) = &result {
                            inner.active.insert(address.clone(), handle.clone());
                        }
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Wait for in-flight connects to finish and keep new ones off the
    /// adapter until the guard drops. Scans call this first.
    pub async fn exclusive_adapter(&self) -> AdapterExclusive {
        AdapterExclusive {
            _guard: self.adapter_gate.clone().write_owned().await,
        }
    }

    async fn attempt_connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<ConnectionHandle, TransportError> {
        let permit = self.acquire_slot().await?;
        let _adapter = self.adapter_gate.clone().read_owned().await;
        self.transition(address, ConnectionState::Connecting, "connect requested")?;

        match self
            .transport
            .connect(address, self.config.connect_timeout)
            .await
        {
            Ok(()) => {
                self.transition(address, ConnectionState::Connected, "link up")?;
                info!("Link to {} established", address);
                Ok(ConnectionHandle {
                    inner: Arc::new(HandleInner {
                        address: address.clone(),
                        connected_at: SystemTime::now(),
                        subscriptions: Mutex::new(HashMap::new()),
                        _permit: permit,
                    }),
                })
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", address, e);
                self.transition(
                    address,
                    ConnectionState::Error,
                    &format!("connect failed: {e}"),
                )?;
                Err(e)
            }
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, TransportError> {
        match self.admission.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::Closed) => Err(TransportError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {
                let parked = self.queued.fetch_add(1, Ordering::SeqCst);
                if parked >= self.config.queue_bound {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(TransportError::CapacityExceeded { queued: parked });
                }
                // Parked callers wait no longer than a connect attempt would;
                // an indefinitely held slot must not wedge the caller
                let result = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.admission.clone().acquire_owned(),
                )
                .await;
                self.queued.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(TransportError::ShuttingDown),
                    Err(_) => Err(TransportError::Timeout),
                }
            }
        }
    }

    fn require_handle(&self, address: &DeviceAddress) -> Result<ConnectionHandle, TransportError> {
        self.inner
            .lock()
            .active
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(address.to_string()))
    }

    /// Write to a characteristic on a connected device
    pub async fn write_char(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.require_handle(address)?;
        self.transport.write(address, characteristic, payload).await
    }

    /// Subscribe to notifications, recording the handler for re-install
    pub async fn start_notify(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let handle = self.require_handle(address)?;
        self.transport
            .subscribe(address, characteristic, handler.clone())
            .await?;
        handle
            .inner
            .subscriptions
            .lock()
            .insert(characteristic, handler);
        Ok(())
    }

    /// Stop notifications. Idempotent: unknown subscriptions succeed.
    pub async fn stop_notify(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if let Some(handle) = self.inner.lock().active.get(address).cloned() {
            handle.inner.subscriptions.lock().remove(&characteristic);
        }
        self.transport.unsubscribe(address, characteristic).await
    }

    /// Operator-initiated teardown: cancel notifications first, then the
    /// link. Idempotent: disconnecting an unknown device succeeds.
    pub async fn disconnect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        let Some(handle) = self.inner.lock().active.remove(address) else {
            return self.transport.disconnect(address).await;
        };

        self.transition(address, ConnectionState::Disconnecting, "operator disconnect")?;
        for characteristic in handle.subscriptions() {
            if let Err(e) = self.transport.unsubscribe(address, characteristic).await {
                debug!("Unsubscribe during disconnect of {}: {}", address, e);
            }
        }
        let result = self.transport.disconnect(address).await;
        self.transition(address, ConnectionState::Disconnected, "closed")?;
        result
    }

    /// Drop handles whose transport no longer reports a link.
    ///
    /// Returns the drops so the caller can arm the reconnection controller.
    pub async fn sweep(&self) -> Vec<LinkDrop> {
        let candidates: Vec<(DeviceAddress, ConnectionHandle)> = self
            .inner
            .lock()
            .active
            .iter()
            .map(|(a, h)| (a.clone(), h.clone()))
            .collect();

        let mut drops = Vec::new();
        for (address, handle) in candidates {
            if self.transport.is_connected(&address).await {
                continue;
            }
            let removed = {
                let mut inner = self.inner.lock();
                match inner.active.get(&address) {
                    Some(current) if current.same_as(&handle) => {
                        inner.active.remove(&address);
                        true
                    }
                    _ => false,
                }
            };
            if !removed {
                continue;
            }

            warn!("Link to {} lost outside operator control", address);
            let subscriptions: Vec<(Uuid, NotificationHandler)> = handle
                .inner
                .subscriptions
                .lock()
                .iter()
                .map(|(u, h)| (*u, h.clone()))
                .collect();

            if self.config.auto_reconnect {
                let _ = self.transition(&address, ConnectionState::Reconnecting, "link lost");
            } else {
                let _ = self.transition(&address, ConnectionState::Disconnecting, "link lost");
                let _ = self.transition(&address, ConnectionState::Disconnected, "link lost");
            }
            drops.push(LinkDrop {
                address,
                subscriptions,
            });
        }
        drops
    }

    /// Periodic sweep task; drops are forwarded to `drops_tx`
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        drops_tx: mpsc::Sender<LinkDrop>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for link_drop in pool.sweep().await {
                            if drops_tx.send(link_drop).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Move a device to terminal `ERROR` if its current state allows it.
    ///
    /// Used by the reconnection controller after exhausting its budget.
    /// Returns whether a transition was applied.
    pub fn mark_error(&self, address: &DeviceAddress, reason: &str) -> bool {
        let current = self.inner.lock().machine.current(address);
        if current == ConnectionState::Error || !current.can_transition_to(ConnectionState::Error) {
            return false;
        }
        self.transition(address, ConnectionState::Error, reason).is_ok()
    }

    /// Current lifecycle state of a device
    pub fn current_state(&self, address: &DeviceAddress) -> ConnectionState {
        self.inner.lock().machine.current(address)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let connected = inner
            .active
            .keys()
            .filter(|a| inner.machine.current(a) == ConnectionState::Connected)
            .count();
        PoolStats {
            active: inner.active.len(),
            connected,
            pending: inner.pending.len(),
            queued: self.queued.load(Ordering::SeqCst),
            capacity: self.config.max_connections,
        }
    }

    pub fn health(&self, address: &DeviceAddress) -> DeviceHealth {
        let inner = self.inner.lock();
        DeviceHealth {
            state: inner.machine.current(address),
            history: inner.machine.history(address),
            subscriptions: inner
                .active
                .get(address)
                .map(|h| h.subscriptions())
                .unwrap_or_default(),
            connected_at: inner.active.get(address).map(|h| h.connected_at()),
        }
    }

    /// Close every link and refuse new admissions
    pub async fn shutdown(&self) {
        self.admission.close();
        let addresses: Vec<DeviceAddress> =
            self.inner.lock().active.keys().cloned().collect();
        for address in addresses {
            if let Err(e) = self.disconnect(&address).await {
                debug!("Disconnect of {} during shutdown: {}", address, e);
            }
        }
        self.inner.lock().machine.clear();
    }

    fn transition(
        &self,
        address: &DeviceAddress,
        state: ConnectionState,
        reason: &str,
    ) -> Result<(), TransportError> {
        let change = self.inner.lock().machine.transition(address, state, reason)?;
        debug!(
            "{}: {:?} -> {:?} ({})",
            address, change.old, change.new, reason
        );
        let _ = self.changes.send(change);
        Ok(())
    }
}
