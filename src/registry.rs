//! Device and vehicle registry
//!
//! The authoritative in-memory record set, owned by the engine and mutated
//! only from its loop. Everything here serializes to the versioned registry
//! documents the external persistence layer stores.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hawk_monitor::ProtocolFamily;
use hawk_transport::DeviceAddress;

use crate::error::EngineError;

/// Registry document schema version
pub const REGISTRY_VERSION: u32 = 1;

/// Provisioning status of a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Seen by a scan, not yet polled
    Discovered,
    /// Operator-approved; polled on its cadence
    Configured,
    /// Needs operator attention
    Error,
}

/// Per-device reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPolicy {
    /// Reconnect attempts before terminal error
    pub retry_attempts: u32,
    /// Base retry interval in seconds
    pub retry_interval_s: u64,
    /// Pause between a drop and the first reconnect attempt, seconds
    pub reconnect_delay_s: u64,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 10,
            retry_interval_s: 1,
            reconnect_delay_s: 5,
        }
    }
}

/// One monitored device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Immutable canonical hardware address
    pub address: DeviceAddress,
    /// Protocol family the device speaks
    pub family: ProtocolFamily,
    /// Operator-facing name
    pub name: String,
    /// Vehicle the device belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    /// Provisioning status
    pub status: DeviceStatus,
    /// When discovery first saw the device
    pub discovered_at: DateTime<Utc>,
    /// When an operator configured it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured_at: Option<DateTime<Utc>>,
    /// Polling cadence in seconds
    pub poll_interval_s: u64,
    /// Reconnection policy
    #[serde(default)]
    pub policy: ConnectionPolicy,
}

impl DeviceRecord {
    /// A fresh record as discovery creates it
    pub fn discovered(
        address: DeviceAddress,
        family: ProtocolFamily,
        name: String,
        poll_interval_s: u64,
    ) -> Self {
        Self {
            address,
            family,
            name,
            vehicle_id: None,
            status: DeviceStatus::Discovered,
            discovered_at: Utc::now(),
            configured_at: None,
            poll_interval_s,
            policy: ConnectionPolicy::default(),
        }
    }

    /// Promote to `configured`; only configured devices are polled
    pub fn configure(&mut self) {
        self.status = DeviceStatus::Configured;
        self.configured_at = Some(Utc::now());
    }
}

/// One vehicle grouping devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Versioned on-disk device document, keyed by address string
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryDoc {
    pub version: u32,
    pub devices: HashMap<String, DeviceRecord>,
}

/// Versioned on-disk vehicle document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleRegistryDoc {
    pub version: u32,
    pub vehicles: HashMap<String, VehicleRecord>,
}

/// Aggregate health of a vehicle's batteries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthRating {
    Good,
    Degraded,
    Bad,
    Unknown,
}

/// Computed summary published on `vehicle.summary`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_devices: usize,
    pub connected_devices: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_capacity: Option<f64>,
    pub overall_health: HealthRating,
    pub devices: Vec<String>,
}

impl VehicleSummary {
    /// Content identity excluding the timestamp, for emission dedup
    pub fn fingerprint(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("timestamp");
        }
        value.to_string()
    }
}

/// In-memory registry; readers get snapshots, only the engine mutates
#[derive(Debug, Default, Clone)]
pub struct Registry {
    devices: HashMap<DeviceAddress, DeviceRecord>,
    vehicles: HashMap<String, VehicleRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate from the persistence documents
    pub fn from_docs(devices: DeviceRegistryDoc, vehicles: VehicleRegistryDoc) -> Self {
        let devices = devices
            .devices
            .into_values()
            .map(|d| (d.address.clone(), d))
            .collect();
        let vehicles = vehicles
            .vehicles
            .into_values()
            .map(|v| (v.id.clone(), v))
            .collect();
        Self { devices, vehicles }
    }

    /// Serialize back into the persistence documents
    pub fn to_docs(&self) -> (DeviceRegistryDoc, VehicleRegistryDoc) {
        (
            DeviceRegistryDoc {
                version: REGISTRY_VERSION,
                devices: self
                    .devices
                    .values()
                    .map(|d| (d.address.to_string(), d.clone()))
                    .collect(),
            },
            VehicleRegistryDoc {
                version: REGISTRY_VERSION,
                vehicles: self
                    .vehicles
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        )
    }

    pub fn device(&self, address: &DeviceAddress) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    pub fn device_mut(&mut self, address: &DeviceAddress) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(address)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn vehicle(&self, id: &str) -> Option<&VehicleRecord> {
        self.vehicles.get(id)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &VehicleRecord> {
        self.vehicles.values()
    }

    /// Devices belonging to a vehicle
    pub fn vehicle_members(&self, vehicle_id: &str) -> Vec<&DeviceRecord> {
        let mut members: Vec<&DeviceRecord> = self
            .devices
            .values()
            .filter(|d| d.vehicle_id.as_deref() == Some(vehicle_id))
            .collect();
        members.sort_by(|a, b| a.address.cmp(&b.address));
        members
    }

    /// Insert a new device; the address must be unused
    pub fn insert_device(&mut self, record: DeviceRecord) -> Result<(), EngineError> {
        if self.devices.contains_key(&record.address) {
            return Err(EngineError::DeviceExists(record.address.clone()));
        }
        self.devices.insert(record.address.clone(), record);
        Ok(())
    }

    pub fn remove_device(&mut self, address: &DeviceAddress) -> Option<DeviceRecord> {
        self.devices.remove(address)
    }

    pub fn insert_vehicle(&mut self, record: VehicleRecord) -> Result<(), EngineError> {
        if self.vehicles.contains_key(&record.id) {
            return Err(EngineError::VehicleExists(record.id.clone()));
        }
        self.vehicles.insert(record.id.clone(), record);
        Ok(())
    }

    /// Remove a vehicle; member devices keep their readings and lose only
    /// the association
    pub fn remove_vehicle(&mut self, id: &str) -> Option<VehicleRecord> {
        let removed = self.vehicles.remove(id);
        if removed.is_some() {
            for device in self.devices.values_mut() {
                if device.vehicle_id.as_deref() == Some(id) {
                    device.vehicle_id = None;
                }
            }
        }
        removed
    }

    /// Point a device at a vehicle. Metadata only: historical readings are
    /// not rewritten. A device belongs to at most one vehicle.
    pub fn associate(
        &mut self,
        vehicle_id: &str,
        address: &DeviceAddress,
    ) -> Result<(), EngineError> {
        if !self.vehicles.contains_key(vehicle_id) {
            return Err(EngineError::UnknownVehicle(vehicle_id.to_string()));
        }
        let device = self
            .devices
            .get_mut(address)
            .ok_or_else(|| EngineError::UnknownDevice(address.clone()))?;
        device.vehicle_id = Some(vehicle_id.to_string());
        Ok(())
    }
}
