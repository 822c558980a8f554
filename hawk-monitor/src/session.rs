//! Device session
//!
//! Binds one device record to the connection pool for the duration of its
//! lifecycle: owns the notification subscription, serializes requests, and
//! turns decoded frames into events for the orchestrator.
//!
//! Requests on the same device queue behind each other; the response is
//! matched by frame type and bounded by a per-command timeout. Repeated
//! failures trip a reconnect request instead of silently retrying forever.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hawk_transport::{ConnectionPool, DeviceAddress, NotificationHandler};

use crate::error::{MonitorError, ProtocolError};
use crate::protocol::{BasicInfo, Frame, ProtocolFamily, RequestKind};
use crate::reading::Reading;

/// Session tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for one request/response exchange
    pub command_timeout: Duration,
    /// Consecutive failures before a forced reconnect is requested
    pub failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Runtime status of one device, updated on every transport operation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeStatus {
    /// Whether the session believes the link is up
    pub connected: bool,
    /// Short code of the last error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Message of the last error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Firmware version learned from basic info
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Label of the last issued command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_command: Option<String>,
}

/// Events a session reports to the orchestrator
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A validated reading was produced
    Reading {
        address: DeviceAddress,
        reading: Reading,
    },
    /// The runtime status changed
    Status {
        address: DeviceAddress,
        status: RuntimeStatus,
    },
    /// Too many consecutive failures; the link should be rebuilt
    ReconnectRequested { address: DeviceAddress },
}

struct PendingRequest {
    kind: RequestKind,
    tx: oneshot::Sender<Frame>,
}

struct SessionShared {
    address: DeviceAddress,
    family: ProtocolFamily,
    events: mpsc::Sender<SessionEvent>,
    closed: AtomicBool,
    failures: AtomicU32,
    failure_threshold: u32,
    pending: Mutex<Option<PendingRequest>>,
    basic_info: Mutex<Option<BasicInfo>>,
    cells: Mutex<Option<Vec<f64>>>,
    status: Mutex<RuntimeStatus>,
}

impl SessionShared {
    /// Decode one notification and route the result.
    ///
    /// Runs on the transport's dispatch path, so it never blocks and never
    /// lets a parse error escape.
    fn on_notification(&self, raw: &[u8]) {
        match self.family.parse_notification(raw) {
            Ok(Frame::Reading(reading)) => self.on_reading(reading),
            Ok(Frame::BasicInfo(info)) => {
                debug!("{}: basic info {:?}", self.address, info);
                self.update_status(|s| s.protocol_version = Some(info.firmware.clone()));
                *self.basic_info.lock() = Some(info.clone());
                self.resolve(RequestKind::BasicInfo, Frame::BasicInfo(info));
            }
            Ok(Frame::CellVoltages(cells)) => {
                debug!("{}: {} cell voltages", self.address, cells.len());
                *self.cells.lock() = Some(cells.clone());
                self.resolve(RequestKind::CellVoltages, Frame::CellVoltages(cells));
            }
            Ok(Frame::Ignored { opcode }) => {
                debug!("{}: ignoring frame with opcode {}", self.address, opcode);
            }
            Err(e) => {
                warn!(
                    "{}: discarding notification ({}): {}",
                    self.address,
                    e,
                    hex::encode(raw)
                );
            }
        }
    }

    fn on_reading(&self, mut reading: Reading) {
        // Fold in slow-changing fields learned from other frames
        if let Some(info) = self.basic_info.lock().as_ref() {
            reading.capacity.get_or_insert(info.capacity_ah);
            reading.cycles.get_or_insert(info.cycles);
        }
        if let Some(cells) = self.cells.lock().as_ref() {
            reading
                .extra
                .insert("cell_voltages".into(), serde_json::json!(cells));
        }

        self.resolve(RequestKind::VoltageTempSoc, Frame::Reading(reading.clone()));

        // A reading parsed mid-close is dropped, never published
        if self.closed.load(Ordering::SeqCst) {
            debug!("{}: reading parsed after close, dropped", self.address);
            return;
        }
        self.update_status(|s| {
            s.connected = true;
            s.error_code = None;
            s.error_message = None;
        });
        self.emit(SessionEvent::Reading {
            address: self.address.clone(),
            reading,
        });
    }

    fn resolve(&self, kind: RequestKind, frame: Frame) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.kind == kind) {
            if let Some(p) = pending.take() {
                let _ = p.tx.send(frame);
            }
        }
    }

    fn update_status(&self, mutate: impl FnOnce(&mut RuntimeStatus)) {
        let changed = {
            let mut status = self.status.lock();
            let before = status.clone();
            mutate(&mut status);
            (*status != before).then(|| status.clone())
        };
        if let Some(status) = changed {
            if !self.closed.load(Ordering::SeqCst) {
                self.emit(SessionEvent::Status {
                    address: self.address.clone(),
                    status,
                });
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            warn!("{}: session event channel full, event dropped", self.address);
        }
    }
}

/// One device bound to the pool
pub struct DeviceSession {
    pool: Arc<ConnectionPool>,
    config: SessionConfig,
    // Serializes request/response cycles per device
    request_gate: tokio::sync::Mutex<()>,
    shared: Arc<SessionShared>,
}

impl DeviceSession {
    /// Create a session; no I/O happens until [`DeviceSession::open`]
    pub fn new(
        pool: Arc<ConnectionPool>,
        address: DeviceAddress,
        family: ProtocolFamily,
        config: SessionConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            address,
            family,
            events,
            closed: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            failure_threshold: config.failure_threshold,
            pending: Mutex::new(None),
            basic_info: Mutex::new(None),
            cells: Mutex::new(None),
            status: Mutex::new(RuntimeStatus::default()),
        });
        Self {
            pool,
            config,
            request_gate: tokio::sync::Mutex::new(()),
            shared,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.shared.address
    }

    pub fn family(&self) -> ProtocolFamily {
        self.shared.family
    }

    /// Snapshot of the runtime status
    pub fn runtime_status(&self) -> RuntimeStatus {
        self.shared.status.lock().clone()
    }

    /// The notification subscription this session installs, for callers
    /// that need to rebuild it after a link drop
    pub fn notification_binding(&self) -> (Uuid, NotificationHandler) {
        let shared = Arc::clone(&self.shared);
        let handler: NotificationHandler = Arc::new(move |_, _, frame| {
            shared.on_notification(frame);
        });
        (self.shared.family.notify_characteristic(), handler)
    }

    /// Connect through the pool and install the notification subscription.
    ///
    /// Idempotent: an already-open link with a live subscription is left
    /// untouched, so poll drivers call this at the top of every cycle.
    pub async fn open(&self) -> Result<(), MonitorError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::SessionClosed);
        }
        let characteristic = self.shared.family.notify_characteristic();
        {
            let health = self.pool.health(&self.shared.address);
            if health.state == hawk_transport::ConnectionState::Connected
                && health.subscriptions.contains(&characteristic)
            {
                return Ok(());
            }
        }
        self.pool.get_or_connect(&self.shared.address).await?;
        let (characteristic, handler) = self.notification_binding();
        self.pool
            .start_notify(&self.shared.address, characteristic, handler)
            .await?;
        info!("Session for {} open", self.shared.address);
        self.shared.update_status(|s| {
            s.connected = true;
            s.error_code = None;
            s.error_message = None;
        });
        Ok(())
    }

    /// Give the link up so another device can use the connection slot.
    ///
    /// The session stays usable: the next [`DeviceSession::open`] call
    /// reconnects and re-subscribes. Runtime status is left alone, the
    /// device is still being serviced.
    pub async fn yield_link(&self) {
        if let Err(e) = self.pool.disconnect(&self.shared.address).await {
            debug!("{}: yielding link: {}", self.shared.address, e);
        }
    }

    /// Unsubscribe, then drop the link. Best effort and idempotent.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.pending.lock().take();

        let characteristic = self.shared.family.notify_characteristic();
        if let Err(e) = self
            .pool
            .stop_notify(&self.shared.address, characteristic)
            .await
        {
            debug!("{}: stop_notify during close: {}", self.shared.address, e);
        }
        if let Err(e) = self.pool.disconnect(&self.shared.address).await {
            debug!("{}: disconnect during close: {}", self.shared.address, e);
        }
        self.shared.status.lock().connected = false;
        info!("Session for {} closed", self.shared.address);
    }

    /// Request voltage, temperature and state of charge
    pub async fn request_voltage_temp(&self) -> Result<Reading, MonitorError> {
        match self.request(RequestKind::VoltageTempSoc).await? {
            Frame::Reading(reading) => Ok(reading),
            other => Err(MonitorError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Request capacity, cycles and firmware version
    pub async fn request_basic_info(&self) -> Result<BasicInfo, MonitorError> {
        match self.request(RequestKind::BasicInfo).await? {
            Frame::BasicInfo(info) => Ok(info),
            other => Err(MonitorError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Request per-cell voltages
    pub async fn request_cell_voltages(&self) -> Result<Vec<f64>, MonitorError> {
        match self.request(RequestKind::CellVoltages).await? {
            Frame::CellVoltages(cells) => Ok(cells),
            other => Err(MonitorError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn request(&self, kind: RequestKind) -> Result<Frame, MonitorError> {
        let _gate = self.request_gate.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::SessionClosed);
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock() = Some(PendingRequest { kind, tx });
        self.shared
            .update_status(|s| s.last_command = Some(kind.label().to_string()));

        let payload = self.shared.family.build_request(kind)?;
        if let Err(e) = self
            .pool
            .write_char(
                &self.shared.address,
                self.shared.family.write_characteristic(),
                &payload,
            )
            .await
        {
            self.shared.pending.lock().take();
            self.note_failure("transport", &e.to_string());
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.command_timeout, rx).await {
            Ok(Ok(frame)) => {
                self.shared.failures.store(0, Ordering::SeqCst);
                Ok(frame)
            }
            _ => {
                self.shared.pending.lock().take();
                if self.shared.closed.load(Ordering::SeqCst) {
                    return Err(MonitorError::SessionClosed);
                }
                self.note_failure("timeout", "no response within deadline");
                Err(MonitorError::CommandTimeout {
                    command: kind.label(),
                })
            }
        }
    }

    /// Record a failed exchange; past the threshold, ask for a reconnect.
    ///
    /// The timeout itself does not drop the link.
    fn note_failure(&self, code: &str, message: &str) {
        self.shared.update_status(|s| {
            s.error_code = Some(code.to_string());
            s.error_message = Some(message.to_string());
        });
        let failures = self.shared.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.shared.failure_threshold {
            warn!(
                "{}: {} consecutive failures, requesting reconnect",
                self.shared.address, failures
            );
            self.shared.failures.store(0, Ordering::SeqCst);
            self.shared.emit(SessionEvent::ReconnectRequested {
                address: self.shared.address.clone(),
            });
        }
    }
}

/// Create the channel sessions report through
pub fn event_channel(capacity: usize) -> (mpsc::Sender<SessionEvent>, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(capacity)
}
