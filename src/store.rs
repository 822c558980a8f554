//! Registry persistence contract
//!
//! Narrow load/save interface the engine hydrates from at startup and
//! writes back to on every registry mutation. The daemon ships a JSON file
//! implementation; tests use the in-memory one.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::registry::{DeviceRegistryDoc, VehicleRegistryDoc};

/// Load/save contract for the registry documents
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Load both documents; missing backing data yields empty documents
    async fn load(&self) -> Result<(DeviceRegistryDoc, VehicleRegistryDoc), StoreError>;

    async fn save_devices(&self, doc: &DeviceRegistryDoc) -> Result<(), StoreError>;

    async fn save_vehicles(&self, doc: &VehicleRegistryDoc) -> Result<(), StoreError>;
}

/// JSON documents in a data directory
pub struct JsonFileStore {
    devices_path: PathBuf,
    vehicles_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            devices_path: data_dir.join("devices.json"),
            vehicles_path: data_dir.join("vehicles.json"),
        }
    }

    async fn read_doc<T: serde::de::DeserializeOwned + Default>(
        path: &PathBuf,
    ) -> Result<T, StoreError> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} absent, starting empty", path.display());
                Ok(T::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_doc<T: serde::Serialize>(path: &PathBuf, doc: &T) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn load(&self) -> Result<(DeviceRegistryDoc, VehicleRegistryDoc), StoreError> {
        Ok((
            Self::read_doc(&self.devices_path).await?,
            Self::read_doc(&self.vehicles_path).await?,
        ))
    }

    async fn save_devices(&self, doc: &DeviceRegistryDoc) -> Result<(), StoreError> {
        Self::write_doc(&self.devices_path, doc).await
    }

    async fn save_vehicles(&self, doc: &VehicleRegistryDoc) -> Result<(), StoreError> {
        Self::write_doc(&self.vehicles_path, doc).await
    }
}

/// Volatile store for tests
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<(DeviceRegistryDoc, VehicleRegistryDoc)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store before engine startup
    pub fn with_docs(devices: DeviceRegistryDoc, vehicles: VehicleRegistryDoc) -> Self {
        Self {
            docs: Mutex::new((devices, vehicles)),
        }
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn load(&self) -> Result<(DeviceRegistryDoc, VehicleRegistryDoc), StoreError> {
        Ok(self.docs.lock().clone())
    }

    async fn save_devices(&self, doc: &DeviceRegistryDoc) -> Result<(), StoreError> {
        self.docs.lock().0 = doc.clone();
        Ok(())
    }

    async fn save_vehicles(&self, doc: &VehicleRegistryDoc) -> Result<(), StoreError> {
        self.docs.lock().1 = doc.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceRecord, REGISTRY_VERSION};
    use hawk_monitor::ProtocolFamily;

    #[tokio::test]
    async fn missing_files_load_as_empty_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let (devices, vehicles) = store.load().await.unwrap();
        assert!(devices.devices.is_empty());
        assert!(vehicles.vehicles.is_empty());
    }

    #[tokio::test]
    async fn documents_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        let record = DeviceRecord::discovered(
            "AA:BB:CC:DD:EE:01".parse().unwrap(),
            ProtocolFamily::Bm6,
            "aux battery".into(),
            60,
        );
        let doc = DeviceRegistryDoc {
            version: REGISTRY_VERSION,
            devices: [(record.address.to_string(), record.clone())].into(),
        };
        store.save_devices(&doc).await.unwrap();

        let (loaded, _) = store.load().await.unwrap();
        assert_eq!(loaded.version, REGISTRY_VERSION);
        assert_eq!(
            loaded.devices.get("AA:BB:CC:DD:EE:01").unwrap(),
            &record
        );
    }
}
