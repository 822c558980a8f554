//! btleplug-backed BLE transport
//!
//! Owns the host adapter and the per-peripheral notification dispatchers.
//! All GATT traffic for the process flows through one instance of this
//! struct; the connection pool layers cap enforcement on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::{DeviceAddress, DiscoveredPeripheral, NotificationHandler};
use crate::{validate_characteristic, validate_payload, Transport};

type HandlerMap = Arc<Mutex<HashMap<(DeviceAddress, Uuid), NotificationHandler>>>;

/// BLE transport over the platform adapter
pub struct BleTransport {
    adapter: Adapter,
    peripherals: Mutex<HashMap<DeviceAddress, Peripheral>>,
    dispatchers: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    handlers: HandlerMap,
}

impl BleTransport {
    /// Open the named adapter, or the first one when `adapter_name` is `None`
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::AdapterMissing(
                "no Bluetooth adapters on this host".into(),
            ));
        }

        let mut chosen = None;
        for adapter in adapters {
            let label = adapter.adapter_info().await.unwrap_or_default();
            match adapter_name {
                Some(wanted) if label.contains(wanted) => {
                    chosen = Some(adapter);
                    break;
                }
                Some(_) => continue,
                None => {
                    chosen = Some(adapter);
                    break;
                }
            }
        }

        let adapter = chosen.ok_or_else(|| {
            TransportError::AdapterMissing(format!(
                "adapter {:?} not present",
                adapter_name.unwrap_or("default")
            ))
        })?;

        info!("Using Bluetooth adapter");
        Ok(Self {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn lookup_peripheral(
        &self,
        address: &DeviceAddress,
    ) -> Result<Peripheral, TransportError> {
        for p in self.adapter.peripherals().await? {
            if p.address().to_string().to_uppercase() == address.as_str() {
                return Ok(p);
            }
        }
        Err(TransportError::UnknownPeripheral(address.to_string()))
    }

    fn connected_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(address.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: Uuid,
    ) -> Result<btleplug::api::Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    /// Route the peripheral's notification stream to registered handlers.
    ///
    /// One task per connected peripheral; delivery order equals arrival
    /// order because the stream is consumed sequentially.
    async fn spawn_dispatcher(
        &self,
        address: &DeviceAddress,
        peripheral: &Peripheral,
    ) -> Result<(), TransportError> {
        let mut stream = peripheral.notifications().await?;
        let handlers = Arc::clone(&self.handlers);
        let addr = address.clone();

        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let handler = handlers
                    .lock()
                    .get(&(addr.clone(), notification.uuid))
                    .cloned();
                match handler {
                    Some(handler) => handler(&addr, notification.uuid, &notification.value),
                    None => debug!(
                        "Dropping notification from {} on unsubscribed {}: {}",
                        addr,
                        notification.uuid,
                        hex::encode(&notification.value)
                    ),
                }
            }
            debug!("Notification stream for {} ended", addr);
        });

        if let Some(old) = self.dispatchers.lock().insert(address.clone(), task) {
            old.abort();
        }
        Ok(())
    }

    fn drop_peripheral(&self, address: &DeviceAddress) -> Option<Peripheral> {
        if let Some(task) = self.dispatchers.lock().remove(address) {
            task.abort();
        }
        self.handlers.lock().retain(|(a, _), _| a != address);
        self.peripherals.lock().remove(address)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let existing = self.peripherals.lock().get(address).cloned();
        if let Some(p) = existing {
            if p.is_connected().await.unwrap_or(false) {
                return Ok(());
            }
        }

        let peripheral = self.lookup_peripheral(address).await?;
        let attempt = async {
            peripheral.connect().await?;
            peripheral.discover_services().await?;
            Ok::<(), TransportError>(())
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::Timeout),
        }

        self.spawn_dispatcher(address, &peripheral).await?;
        self.peripherals
            .lock()
            .insert(address.clone(), peripheral);
        info!("Connected to {}", address);
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress) -> Result<(), TransportError> {
        let Some(peripheral) = self.drop_peripheral(address) else {
            return Ok(());
        };
        if let Err(e) = peripheral.disconnect().await {
            // Already-gone links are a success for teardown purposes
            debug!("Disconnect from {} reported: {}", address, e);
        }
        info!("Disconnected from {}", address);
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
        let peripheral = self.connected_peripheral(address)?;
        let c = Self::find_characteristic(&peripheral, characteristic)?;
        debug!("TX {} {}: {}", address, characteristic, hex::encode(payload));
        peripheral
            .write(&c, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        validate_characteristic(characteristic)?;
        let peripheral = self.connected_peripheral(address)?;
        let c = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&c).await?;
        self.handlers
            .lock()
            .insert((address.clone(), characteristic), handler);
        debug!("Subscribed to {} on {}", characteristic, address);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        validate_characteristic(characteristic)?;
        self.handlers
            .lock()
            .remove(&(address.clone(), characteristic));

        let Ok(peripheral) = self.connected_peripheral(address) else {
            return Ok(());
        };
        match Self::find_characteristic(&peripheral, characteristic) {
            Ok(c) => {
                if let Err(e) = peripheral.unsubscribe(&c).await {
                    debug!("Unsubscribe {} on {} reported: {}", characteristic, address, e);
                }
            }
            Err(_) => debug!("Unsubscribe for unknown characteristic {}", characteristic),
        }
        Ok(())
    }

    async fn is_connected(&self, address: &DeviceAddress) -> bool {
        let Some(peripheral) = self.peripherals.lock().get(address).cloned() else {
            return false;
        };
        peripheral.is_connected().await.unwrap_or(false)
    }

    async fn scan(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<DiscoveredPeripheral>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::AdapterBusy(e.to_string()))?;
        info!("Scanning for {:?}", duration);

        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            let peripherals = match adapter.peripherals().await {
                Ok(p) => p,
                Err(e) => {
                    warn!("Failed to list peripherals after scan: {}", e);
                    return;
                }
            };
            for p in peripherals {
                let Ok(address) = p.address().to_string().parse::<DeviceAddress>() else {
                    continue;
                };
                let props = p.properties().await.ok().flatten();
                let discovered = DiscoveredPeripheral {
                    address,
                    local_name: props.as_ref().and_then(|p| p.local_name.clone()),
                    manufacturer_data: props
                        .map(|p| p.manufacturer_data)
                        .unwrap_or_default(),
                };
                if tx.send(discovered).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
