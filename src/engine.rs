//! Engine orchestrator
//!
//! Owns the authoritative registry, the connection pool, the scheduler, and
//! the event bus, and coordinates everything between them: discovery cycles,
//! session lifecycles, reconnection arming, vehicle summaries, and the
//! operator command surface. All registry mutations happen on the engine
//! loop; the outside world talks to it through [`EngineHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hawk_monitor::{
    DeviceSession, ProtocolFamily, Reading, RuntimeStatus, SessionConfig, SessionEvent,
};
use hawk_transport::pool::LinkDrop;
use hawk_transport::{
    BackoffPolicy, BoxedTransport, ConnectionPool, ConnectionState, DeviceAddress, PoolConfig,
    PoolStats, ReconnectController, ReconnectOutcome, StateChange,
};

use crate::bus::{BusEvent, EventBus, Subscription, Topic};
use crate::config::Config;
use crate::error::EngineError;
use crate::mqtt::{spawn_bus_bridge, MqttClient, MqttStats};
use crate::registry::{
    DeviceRecord, DeviceStatus, HealthRating, Registry, VehicleRecord, VehicleSummary,
};
use crate::scheduler::PollScheduler;
use crate::sink::{spawn_sink_forwarder, ReadingSink};
use crate::store::RegistryStore;

/// Poll cadence assigned to devices that do not specify one
pub const DEFAULT_POLL_INTERVAL_S: u64 = 60;
/// Stale-link sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// System status publication cadence
const SYSTEM_STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// MQTT queue flush budget at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Operator request to register a device
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub address: DeviceAddress,
    pub family: ProtocolFamily,
    pub name: Option<String>,
    pub poll_interval_s: Option<u64>,
}

/// Per-device view in the health snapshot
#[derive(Debug, Clone)]
pub struct DeviceHealthView {
    pub address: DeviceAddress,
    pub state: ConnectionState,
    pub status: Option<RuntimeStatus>,
}

/// Whole-daemon health snapshot
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub running: bool,
    pub uptime_s: u64,
    pub version: &'static str,
    pub device_count: usize,
    pub configured_devices: usize,
    pub connected_devices: usize,
    pub pool: PoolStats,
    pub bus_overflow: u64,
    pub mqtt: Option<MqttStats>,
    pub devices: Vec<DeviceHealthView>,
}

enum Command {
    ListDevices(oneshot::Sender<Vec<DeviceRecord>>),
    GetDevice(DeviceAddress, oneshot::Sender<Option<DeviceRecord>>),
    AddDevice(NewDevice, oneshot::Sender<Result<DeviceRecord, EngineError>>),
    ConfigureDevice(DeviceAddress, oneshot::Sender<Result<DeviceRecord, EngineError>>),
    RemoveDevice(DeviceAddress, oneshot::Sender<Result<(), EngineError>>),
    ListVehicles(oneshot::Sender<Vec<VehicleRecord>>),
    AddVehicle {
        id: String,
        name: String,
        reply: oneshot::Sender<Result<VehicleRecord, EngineError>>,
    },
    RemoveVehicle(String, oneshot::Sender<Result<(), EngineError>>),
    Associate {
        vehicle_id: String,
        address: DeviceAddress,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    LatestReading(DeviceAddress, oneshot::Sender<Option<Reading>>),
    Health(oneshot::Sender<EngineHealth>),
    ForceReconnect(DeviceAddress, oneshot::Sender<Result<(), EngineError>>),
    StartDiscovery(oneshot::Sender<()>),
    StopDiscovery(oneshot::Sender<()>),
    ReloadRegistry(oneshot::Sender<Result<(), EngineError>>),
    Shutdown(oneshot::Sender<()>),
}

enum Internal {
    OpenFailed { address: DeviceAddress },
}

/// Entry point for constructing a running engine
pub struct Engine;

impl Engine {
    /// Hydrate the registry, start every subsystem, and return the handle.
    ///
    /// The transport is injected so tests run the whole engine against the
    /// mock; the daemon passes the btleplug transport.
    pub async fn start(
        config: Config,
        transport: BoxedTransport,
        store: Arc<dyn RegistryStore>,
        sink: Option<Arc<dyn ReadingSink>>,
    ) -> Result<EngineHandle, EngineError> {
        let (device_doc, vehicle_doc) = store.load().await?;
        let registry = Registry::from_docs(device_doc, vehicle_doc);
        info!(
            "Registry hydrated: {} devices, {} vehicles",
            registry.devices().count(),
            registry.vehicles().count()
        );

        let bus = EventBus::new(crate::bus::DEFAULT_QUEUE_CAPACITY);
        let pool = ConnectionPool::new(
            transport,
            PoolConfig {
                max_connections: config.bluetooth.max_concurrent_connections,
                connect_timeout: Duration::from_secs(config.bluetooth.connection_timeout_s),
                ..PoolConfig::default()
            },
        );
        let (controller, outcomes) = ReconnectController::new(pool.clone(), BackoffPolicy::default());
        let scheduler = PollScheduler::new(config.bluetooth.max_concurrent_connections, bus.clone());

        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (session_tx, session_rx) = mpsc::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(32);
        let (drops_tx, drops_rx) = mpsc::channel(32);

        pool.spawn_sweeper(SWEEP_INTERVAL, drops_tx, cancel.child_token());

        let mqtt = if config.mqtt.enabled {
            let client = MqttClient::new(config.mqtt.clone(), SHUTDOWN_GRACE);
            client.start();
            spawn_bus_bridge(&bus, Arc::clone(&client), cancel.child_token());
            Some(client)
        } else {
            None
        };

        if let Some(sink) = sink {
            spawn_sink_forwarder(&bus, sink, cancel.child_token());
        }

        let state_changes = pool.subscribe_state_changes();
        let mut core = EngineCore {
            config,
            bus: bus.clone(),
            pool,
            controller,
            scheduler,
            store,
            registry,
            sessions: HashMap::new(),
            latest: HashMap::new(),
            statuses: HashMap::new(),
            summary_cache: HashMap::new(),
            session_tx,
            internal_tx,
            mqtt,
            discovery_enabled: true,
            started_at: Instant::now(),
            cancel: cancel.clone(),
        };

        // Sessions for everything already configured
        let configured: Vec<DeviceRecord> = core
            .registry
            .devices()
            .filter(|d| d.status == DeviceStatus::Configured)
            .cloned()
            .collect();
        for record in configured {
            core.start_device(&record);
        }

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            core.run(cmd_rx, session_rx, internal_rx, drops_rx, outcomes, state_changes, loop_cancel)
                .await;
        });

        Ok(EngineHandle {
            cmd_tx,
            bus,
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        })
    }
}

struct EngineCore {
    config: Config,
    bus: EventBus,
    pool: Arc<ConnectionPool>,
    controller: Arc<ReconnectController>,
    scheduler: PollScheduler,
    store: Arc<dyn RegistryStore>,
    registry: Registry,
    sessions: HashMap<DeviceAddress, Arc<DeviceSession>>,
    latest: HashMap<DeviceAddress, Reading>,
    statuses: HashMap<DeviceAddress, RuntimeStatus>,
    // vehicle id -> fingerprint of the last emitted summary
    summary_cache: HashMap<String, String>,
    session_tx: mpsc::Sender<SessionEvent>,
    internal_tx: mpsc::Sender<Internal>,
    mqtt: Option<Arc<MqttClient>>,
    discovery_enabled: bool,
    started_at: Instant,
    // Root token for the background tasks spawned at startup
    cancel: CancellationToken,
}

impl EngineCore {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut session_rx: mpsc::Receiver<SessionEvent>,
        mut internal_rx: mpsc::Receiver<Internal>,
        mut drops_rx: mpsc::Receiver<LinkDrop>,
        mut outcomes: mpsc::Receiver<ReconnectOutcome>,
        mut state_changes: broadcast::Receiver<StateChange>,
        cancel: CancellationToken,
    ) {
        let discovery_period = self
            .config
            .discovery
            .periodic_interval()
            .max(Duration::from_secs(1));
        let first_scan = if self.config.discovery.initial_scan {
            Instant::now()
        } else {
            Instant::now() + discovery_period
        };
        let mut discovery_timer = tokio::time::interval_at(first_scan, discovery_period);
        let mut status_timer = tokio::time::interval_at(
            Instant::now() + SYSTEM_STATUS_INTERVAL,
            SYSTEM_STATUS_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown_sequence().await;
                    return;
                }
                command = cmd_rx.recv() => match command {
                    None => break,
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown_sequence().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                event = session_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_session_event(event).await;
                    }
                }
                internal = internal_rx.recv() => {
                    if let Some(Internal::OpenFailed { address }) = internal {
                        self.arm_reconnect_for(&address);
                    }
                }
                link_drop = drops_rx.recv() => {
                    if let Some(link_drop) = link_drop {
                        self.handle_link_drop(link_drop);
                    }
                }
                outcome = outcomes.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_reconnect_outcome(outcome).await;
                    }
                }
                change = state_changes.recv() => match change {
                    Ok(change) => self.bus.publish(BusEvent::DeviceConnection {
                        address: change.address,
                        old: change.old,
                        new: change.new,
                    }),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} connection state changes", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = discovery_timer.tick(), if self.discovery_enabled => {
                    self.run_discovery_cycle().await;
                }
                _ = status_timer.tick() => {
                    if let Some(mqtt) = &self.mqtt {
                        mqtt.publish_system_status(self.system_status_doc());
                    }
                }
            }
        }
        self.shutdown_sequence().await;
    }

    // ========================================================================
    // Operator commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ListDevices(reply) => {
                let _ = reply.send(self.registry.devices().cloned().collect());
            }
            Command::GetDevice(address, reply) => {
                let _ = reply.send(self.registry.device(&address).cloned());
            }
            Command::AddDevice(spec, reply) => {
                let _ = reply.send(self.add_device(spec).await);
            }
            Command::ConfigureDevice(address, reply) => {
                let _ = reply.send(self.configure_device(address).await);
            }
            Command::RemoveDevice(address, reply) => {
                let _ = reply.send(self.remove_device(address).await);
            }
            Command::ListVehicles(reply) => {
                let _ = reply.send(self.registry.vehicles().cloned().collect());
            }
            Command::AddVehicle { id, name, reply } => {
                let _ = reply.send(self.add_vehicle(id, name).await);
            }
            Command::RemoveVehicle(id, reply) => {
                let result = match self.registry.remove_vehicle(&id) {
                    Some(_) => {
                        self.summary_cache.remove(&id);
                        self.save_registry().await
                    }
                    None => Err(EngineError::UnknownVehicle(id)),
                };
                let _ = reply.send(result);
            }
            Command::Associate {
                vehicle_id,
                address,
                reply,
            } => {
                let result = match self.registry.associate(&vehicle_id, &address) {
                    Ok(()) => {
                        self.bus.publish(BusEvent::VehicleAssociated {
                            vehicle_id: vehicle_id.clone(),
                            address: address.clone(),
                        });
                        self.recompute_summary(&vehicle_id);
                        self.save_registry().await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::LatestReading(address, reply) => {
                let _ = reply.send(self.latest.get(&address).cloned());
            }
            Command::Health(reply) => {
                let _ = reply.send(self.health_snapshot());
            }
            Command::ForceReconnect(address, reply) => {
                let result = if self.registry.device(&address).is_some() {
                    self.restart_session(&address).await;
                    Ok(())
                } else {
                    Err(EngineError::UnknownDevice(address))
                };
                let _ = reply.send(result);
            }
            Command::StartDiscovery(reply) => {
                self.discovery_enabled = true;
                self.run_discovery_cycle().await;
                let _ = reply.send(());
            }
            Command::StopDiscovery(reply) => {
                self.discovery_enabled = false;
                let _ = reply.send(());
            }
            Command::ReloadRegistry(reply) => {
                let _ = reply.send(self.reload_registry().await);
            }
            Command::Shutdown(_) => unreachable!("handled in the loop"),
        }
    }

    async fn add_device(&mut self, spec: NewDevice) -> Result<DeviceRecord, EngineError> {
        let name = spec
            .name
            .unwrap_or_else(|| spec.address.to_string());
        let mut record = DeviceRecord::discovered(
            spec.address,
            spec.family,
            name,
            spec.poll_interval_s.unwrap_or(DEFAULT_POLL_INTERVAL_S),
        );
        // Operator-added devices are polled right away
        record.configure();
        self.registry.insert_device(record.clone())?;
        self.save_registry().await?;
        self.start_device(&record);
        Ok(record)
    }

    async fn configure_device(
        &mut self,
        address: DeviceAddress,
    ) -> Result<DeviceRecord, EngineError> {
        let record = self
            .registry
            .device_mut(&address)
            .ok_or_else(|| EngineError::UnknownDevice(address.clone()))?;
        if record.status != DeviceStatus::Configured {
            record.configure();
        }
        let record = record.clone();
        self.save_registry().await?;
        if !self.sessions.contains_key(&address) {
            self.start_device(&record);
        }
        Ok(record)
    }

    async fn remove_device(&mut self, address: DeviceAddress) -> Result<(), EngineError> {
        if self.registry.device(&address).is_none() {
            return Err(EngineError::UnknownDevice(address));
        }
        self.stop_device(&address).await;
        let removed = self.registry.remove_device(&address);
        self.latest.remove(&address);
        self.statuses.remove(&address);
        if let Some(vehicle_id) = removed.and_then(|r| r.vehicle_id) {
            self.recompute_summary(&vehicle_id);
        }
        self.save_registry().await
    }

    async fn add_vehicle(
        &mut self,
        id: String,
        name: String,
    ) -> Result<VehicleRecord, EngineError> {
        let record = VehicleRecord {
            id,
            name,
            created_at: Utc::now(),
        };
        self.registry.insert_vehicle(record.clone())?;
        self.save_registry().await?;
        Ok(record)
    }

    /// Re-read the persistence documents and reconcile running sessions
    async fn reload_registry(&mut self) -> Result<(), EngineError> {
        let (device_doc, vehicle_doc) = self.store.load().await?;
        let fresh = Registry::from_docs(device_doc, vehicle_doc);

        let stale: Vec<DeviceAddress> = self
            .sessions
            .keys()
            .filter(|a| {
                fresh
                    .device(a)
                    .map(|d| d.status != DeviceStatus::Configured)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for address in stale {
            self.stop_device(&address).await;
        }

        self.registry = fresh;
        let to_start: Vec<DeviceRecord> = self
            .registry
            .devices()
            .filter(|d| {
                d.status == DeviceStatus::Configured && !self.sessions.contains_key(&d.address)
            })
            .cloned()
            .collect();
        for record in to_start {
            self.start_device(&record);
        }
        info!("Registry reloaded and reconciled");
        Ok(())
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn start_device(&mut self, record: &DeviceRecord) {
        let session = Arc::new(DeviceSession::new(
            self.pool.clone(),
            record.address.clone(),
            record.family,
            SessionConfig::default(),
            self.session_tx.clone(),
        ));
        self.sessions.insert(record.address.clone(), session.clone());
        self.scheduler.register(
            session.clone(),
            Duration::from_secs(record.poll_interval_s.max(1)),
        );

        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = session.open().await {
                warn!("Opening session for {} failed: {}", session.address(), e);
                let _ = internal_tx
                    .send(Internal::OpenFailed {
                        address: session.address().clone(),
                    })
                    .await;
            }
        });
    }

    async fn stop_device(&mut self, address: &DeviceAddress) {
        self.scheduler.deregister(address);
        self.controller.cancel(address);
        if let Some(session) = self.sessions.remove(address) {
            session.close().await;
        }
    }

    /// Tear the session down and bring up a fresh one on the same record
    async fn restart_session(&mut self, address: &DeviceAddress) {
        let Some(record) = self.registry.device(address).cloned() else {
            return;
        };
        info!("Force reconnect of {}", address);
        self.stop_device(address).await;
        self.start_device(&record);
    }

    fn arm_reconnect_for(&mut self, address: &DeviceAddress) {
        let Some(record) = self.registry.device(address) else {
            return;
        };
        let Some(session) = self.sessions.get(address) else {
            return;
        };
        let (characteristic, handler) = session.notification_binding();
        let policy = BackoffPolicy {
            max_attempts: record.policy.retry_attempts,
            initial_delay: Duration::from_secs(record.policy.retry_interval_s.max(1)),
            post_drop_delay: Duration::from_secs(record.policy.reconnect_delay_s),
            ..BackoffPolicy::default()
        };
        self.controller.schedule_with_policy(
            LinkDrop {
                address: address.clone(),
                subscriptions: vec![(characteristic, handler)],
            },
            policy,
        );
    }

    fn handle_link_drop(&mut self, link_drop: LinkDrop) {
        let address = link_drop.address.clone();
        self.note_disconnected(&address);
        let Some(record) = self.registry.device(&address) else {
            debug!("Dropping link event for unregistered {}", address);
            return;
        };
        let policy = BackoffPolicy {
            max_attempts: record.policy.retry_attempts,
            initial_delay: Duration::from_secs(record.policy.retry_interval_s.max(1)),
            post_drop_delay: Duration::from_secs(record.policy.reconnect_delay_s),
            ..BackoffPolicy::default()
        };
        self.controller.schedule_with_policy(link_drop, policy);
    }

    async fn handle_reconnect_outcome(&mut self, outcome: ReconnectOutcome) {
        match outcome {
            ReconnectOutcome::Reestablished { address } => {
                let status = self.statuses.entry(address.clone()).or_default();
                status.connected = true;
                status.error_code = None;
                status.error_message = None;
                let status = status.clone();
                self.bus.publish(BusEvent::DeviceStatus {
                    address: address.clone(),
                    status,
                });
                self.recompute_summary_for_device(&address);
            }
            ReconnectOutcome::GaveUp { address } => {
                if let Some(record) = self.registry.device_mut(&address) {
                    record.status = DeviceStatus::Error;
                }
                let status = self.statuses.entry(address.clone()).or_default();
                status.connected = false;
                status.error_code = Some("reconnect_exhausted".into());
                status.error_message =
                    Some("reconnect attempts exhausted, operator action required".into());
                let status = status.clone();
                self.bus.publish(BusEvent::DeviceStatus {
                    address: address.clone(),
                    status,
                });
                if let Err(e) = self.save_registry().await {
                    warn!("Persisting terminal error for {}: {}", address, e);
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Reading { address, reading } => {
                let Some(record) = self.registry.device(&address) else {
                    // Raced against removal; the reading dies here
                    debug!("Reading from unregistered {} dropped", address);
                    return;
                };
                let vehicle_id = record.vehicle_id.clone();
                let family = record.family;
                self.latest.insert(address.clone(), reading.clone());
                self.bus.publish(BusEvent::DeviceReading {
                    address: address.clone(),
                    reading,
                    vehicle_id: vehicle_id.clone(),
                    family,
                });
                if let Some(vehicle_id) = vehicle_id {
                    self.recompute_summary(&vehicle_id);
                }
            }
            SessionEvent::Status { address, status } => {
                if self.registry.device(&address).is_none() {
                    return;
                }
                self.statuses.insert(address.clone(), status.clone());
                self.bus
                    .publish(BusEvent::DeviceStatus { address: address.clone(), status });
                self.recompute_summary_for_device(&address);
            }
            SessionEvent::ReconnectRequested { address } => {
                self.restart_session(&address).await;
            }
        }
    }

    fn note_disconnected(&mut self, address: &DeviceAddress) {
        let status = self.statuses.entry(address.clone()).or_default();
        if status.connected {
            status.connected = false;
            status.error_code = Some("link_lost".into());
            status.error_message = Some("link lost outside operator control".into());
            let status = status.clone();
            self.bus.publish(BusEvent::DeviceStatus {
                address: address.clone(),
                status,
            });
            self.recompute_summary_for_device(address);
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    async fn run_discovery_cycle(&mut self) {
        info!("Discovery scan starting");
        // Scans need the adapter to themselves: drain polls, block admissions,
        // then shut connect attempts out of the adapter
        let pause = match self.scheduler.pause().await {
            Ok(pause) => pause,
            Err(_) => return, // shutting down
        };
        let adapter = self.pool.exclusive_adapter().await;
        let scan = self
            .pool
            .transport()
            .scan(self.config.discovery.scan_duration())
            .await;
        match scan {
            Ok(mut results) => {
                let mut seen = 0usize;
                while let Some(peripheral) = results.recv().await {
                    seen += 1;
                    self.register_discovered(peripheral).await;
                }
                info!("Discovery scan finished: {} peripherals", seen);
            }
            Err(e) => warn!("Discovery scan failed: {}", e),
        }
        drop(adapter);
        drop(pause);

        // Configured devices stuck in ERROR get a fresh session and a fresh
        // retry budget on every discovery tick; records an operator already
        // has to look at (status error) stay down until told otherwise
        let stuck: Vec<DeviceAddress> = self
            .registry
            .devices()
            .filter(|d| {
                d.status == DeviceStatus::Configured
                    && self.pool.current_state(&d.address) == ConnectionState::Error
            })
            .map(|d| d.address.clone())
            .collect();
        for address in stuck {
            info!("Re-arming {} after discovery tick", address);
            self.restart_session(&address).await;
        }
    }

    async fn register_discovered(
        &mut self,
        peripheral: hawk_transport::DiscoveredPeripheral,
    ) {
        if self.registry.device(&peripheral.address).is_some() {
            return;
        }
        let family = ProtocolFamily::from_advertisement(peripheral.local_name.as_deref());
        let name = peripheral
            .local_name
            .clone()
            .unwrap_or_else(|| peripheral.address.to_string());
        let record = DeviceRecord::discovered(
            peripheral.address.clone(),
            family,
            name,
            DEFAULT_POLL_INTERVAL_S,
        );
        info!(
            "Discovered {} ({}, {:?})",
            record.address, record.name, family
        );
        if self.registry.insert_device(record).is_ok() {
            if let Err(e) = self.save_registry().await {
                warn!("Persisting discovery of {}: {}", peripheral.address, e);
            }
            self.bus.publish(BusEvent::DeviceDiscovered {
                address: peripheral.address,
                local_name: peripheral.local_name,
                family,
            });
        }
    }

    // ========================================================================
    // Summaries and health
    // ========================================================================

    fn recompute_summary_for_device(&mut self, address: &DeviceAddress) {
        let vehicle_id = self
            .registry
            .device(address)
            .and_then(|r| r.vehicle_id.clone());
        if let Some(vehicle_id) = vehicle_id {
            self.recompute_summary(&vehicle_id);
        }
    }

    /// Recompute a vehicle summary and publish it unless it is
    /// content-identical to the last emission
    fn recompute_summary(&mut self, vehicle_id: &str) {
        if self.registry.vehicle(vehicle_id).is_none() {
            return;
        }
        let members = self.registry.vehicle_members(vehicle_id);
        let total_devices = members.len();
        let connected_devices = members
            .iter()
            .filter(|d| {
                self.statuses
                    .get(&d.address)
                    .map(|s| s.connected)
                    .unwrap_or(false)
            })
            .count();

        let readings: Vec<&Reading> = members
            .iter()
            .filter_map(|d| self.latest.get(&d.address))
            .collect();
        let average_voltage = (!readings.is_empty())
            .then(|| readings.iter().map(|r| r.voltage).sum::<f64>() / readings.len() as f64);
        let capacities: Vec<f64> = readings.iter().filter_map(|r| r.capacity).collect();
        let total_capacity = (!capacities.is_empty()).then(|| capacities.iter().sum());

        let overall_health = if readings.is_empty() {
            HealthRating::Unknown
        } else {
            let min_soc = readings
                .iter()
                .map(|r| r.state_of_charge)
                .fold(f64::INFINITY, f64::min);
            if min_soc >= 60.0 {
                HealthRating::Good
            } else if min_soc >= 30.0 {
                HealthRating::Degraded
            } else {
                HealthRating::Bad
            }
        };

        let summary = VehicleSummary {
            vehicle_id: vehicle_id.to_string(),
            timestamp: Utc::now(),
            total_devices,
            connected_devices,
            average_voltage,
            total_capacity,
            overall_health,
            devices: members.iter().map(|d| d.address.to_string()).collect(),
        };

        let fingerprint = summary.fingerprint();
        if self.summary_cache.get(vehicle_id) == Some(&fingerprint) {
            return;
        }
        self.summary_cache
            .insert(vehicle_id.to_string(), fingerprint);
        self.bus.publish(BusEvent::VehicleSummary {
            vehicle_id: vehicle_id.to_string(),
            summary,
        });
    }

    fn health_snapshot(&self) -> EngineHealth {
        let devices = self
            .registry
            .devices()
            .map(|d| DeviceHealthView {
                address: d.address.clone(),
                state: self.pool.current_state(&d.address),
                status: self.statuses.get(&d.address).cloned(),
            })
            .collect();
        EngineHealth {
            running: true,
            uptime_s: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
            device_count: self.registry.devices().count(),
            configured_devices: self
                .registry
                .devices()
                .filter(|d| d.status == DeviceStatus::Configured)
                .count(),
            connected_devices: self
                .statuses
                .values()
                .filter(|s| s.connected)
                .count(),
            pool: self.pool.stats(),
            bus_overflow: self.bus.overflow_total(),
            mqtt: self.mqtt.as_ref().map(|m| m.stats()),
            devices,
        }
    }

    fn system_status_doc(&self) -> serde_json::Value {
        let health = self.health_snapshot();
        json!({
            "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "core": {
                "running": health.running,
                "uptime_s": health.uptime_s,
                "version": health.version,
            },
            "storage": {
                "connected": self.config.storage.enabled,
            },
            "components": {
                "mqtt": self
                    .mqtt
                    .as_ref()
                    .map(|m| format!("{:?}", m.state()).to_uppercase())
                    .unwrap_or_else(|| "DISABLED".into()),
                "bluetooth": format!(
                    "{}/{} connections",
                    health.pool.connected, health.pool.capacity
                ),
                "api": "external",
            },
        })
    }

    async fn save_registry(&self) -> Result<(), EngineError> {
        let (device_doc, vehicle_doc) = self.registry.to_docs();
        self.store.save_devices(&device_doc).await?;
        self.store.save_vehicles(&vehicle_doc).await?;
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Ordered teardown: discovery, poll drivers, sessions, reconnection,
    /// pool, MQTT flush, final bus event
    async fn shutdown_sequence(&mut self) {
        info!("Engine shutting down");
        self.discovery_enabled = false;
        self.cancel.cancel();
        self.scheduler.shutdown();

        let addresses: Vec<DeviceAddress> = self.sessions.keys().cloned().collect();
        for address in addresses {
            self.controller.cancel(&address);
            if let Some(session) = self.sessions.remove(&address) {
                session.close().await;
            }
        }
        self.controller.cancel_all();
        self.pool.shutdown().await;

        if let Some(mqtt) = &self.mqtt {
            mqtt.shutdown().await;
        }

        self.bus.publish(BusEvent::SystemShutdown);
        self.bus.close();
        info!("Engine stopped");
    }
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    bus: EventBus,
    task: Arc<parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, EngineError> {
        self.request(Command::ListDevices).await
    }

    pub async fn get_device(
        &self,
        address: DeviceAddress,
    ) -> Result<Option<DeviceRecord>, EngineError> {
        self.request(|tx| Command::GetDevice(address, tx)).await
    }

    pub async fn add_device(&self, spec: NewDevice) -> Result<DeviceRecord, EngineError> {
        self.request(|tx| Command::AddDevice(spec, tx)).await?
    }

    /// Promote a discovered device to configured (polled)
    pub async fn configure_device(
        &self,
        address: DeviceAddress,
    ) -> Result<DeviceRecord, EngineError> {
        self.request(|tx| Command::ConfigureDevice(address, tx))
            .await?
    }

    pub async fn remove_device(&self, address: DeviceAddress) -> Result<(), EngineError> {
        self.request(|tx| Command::RemoveDevice(address, tx)).await?
    }

    pub async fn list_vehicles(&self) -> Result<Vec<VehicleRecord>, EngineError> {
        self.request(Command::ListVehicles).await
    }

    pub async fn add_vehicle(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<VehicleRecord, EngineError> {
        let (id, name) = (id.into(), name.into());
        self.request(|reply| Command::AddVehicle { id, name, reply })
            .await?
    }

    pub async fn remove_vehicle(&self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        self.request(|tx| Command::RemoveVehicle(id, tx)).await?
    }

    pub async fn associate(
        &self,
        vehicle_id: impl Into<String>,
        address: DeviceAddress,
    ) -> Result<(), EngineError> {
        let vehicle_id = vehicle_id.into();
        self.request(|reply| Command::Associate {
            vehicle_id,
            address,
            reply,
        })
        .await?
    }

    pub async fn latest_reading(
        &self,
        address: DeviceAddress,
    ) -> Result<Option<Reading>, EngineError> {
        self.request(|tx| Command::LatestReading(address, tx)).await
    }

    pub async fn health(&self) -> Result<EngineHealth, EngineError> {
        self.request(Command::Health).await
    }

    pub async fn force_reconnect(&self, address: DeviceAddress) -> Result<(), EngineError> {
        self.request(|tx| Command::ForceReconnect(address, tx))
            .await?
    }

    pub async fn start_discovery(&self) -> Result<(), EngineError> {
        self.request(Command::StartDiscovery).await
    }

    pub async fn stop_discovery(&self) -> Result<(), EngineError> {
        self.request(Command::StopDiscovery).await
    }

    pub async fn reload_registry(&self) -> Result<(), EngineError> {
        self.request(Command::ReloadRegistry).await?
    }

    /// Live stream of events on one bus topic
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    /// Orderly shutdown; resolves when the engine loop has stopped
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
