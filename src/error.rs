//! Daemon-level error types

use hawk_monitor::MonitorError;
use hawk_transport::{DeviceAddress, TransportError};
use thiserror::Error;

/// Errors from the engine's operator surface
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Device {0} already registered")]
    DeviceExists(DeviceAddress),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceAddress),

    #[error("Vehicle {0} already registered")]
    VehicleExists(String),

    #[error("Unknown vehicle {0}")]
    UnknownVehicle(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Errors from the registry persistence contract
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document error: {0}")]
    Document(#[from] serde_json::Error),
}

/// Errors from loading the daemon configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config syntax: {0}")]
    Syntax(#[from] toml::de::Error),
}
