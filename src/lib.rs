//! battery-hawk: BLE battery monitor fleet daemon
//!
//! Long-running service that polls a fleet of Bluetooth Low Energy battery
//! monitors, normalizes their readings, and fans state changes out to MQTT
//! and a pluggable time-series sink. Built on top of:
//!
//! - [`hawk_transport`] - BLE transport abstraction, connection pool,
//!   state machine, reconnection controller
//! - [`hawk_monitor`] - protocol codecs and per-device sessions
//!
//! The [`engine::Engine`] ties everything together; [`engine::EngineHandle`]
//! is the operator surface the REST and CLI layers translate to.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod mqtt;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod store;

pub use bus::{BusEvent, EventBus, Subscription, Topic};
pub use config::Config;
pub use engine::{Engine, EngineHandle, EngineHealth, NewDevice, DEFAULT_POLL_INTERVAL_S};
pub use error::{ConfigError, EngineError, StoreError};
pub use mqtt::{MqttClient, MqttState, MqttStats};
pub use registry::{
    ConnectionPolicy, DeviceRecord, DeviceStatus, HealthRating, Registry, VehicleRecord,
    VehicleSummary,
};
pub use scheduler::PollScheduler;
pub use sink::{ReadingSink, SinkStatus};
pub use store::{JsonFileStore, MemoryStore, RegistryStore};
