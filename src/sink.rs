//! Time-series sink contract
//!
//! Readings fan out to an opaque writer through a single method. The core
//! never retries: a `Deferred` or `Dropped` verdict is the writer's own
//! availability policy at work and is only counted here.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hawk_monitor::Reading;
use hawk_transport::DeviceAddress;

use crate::bus::{BusEvent, EventBus, Topic};

/// Writer verdict for one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// Persisted
    Ok,
    /// Accepted for later persistence
    Deferred,
    /// Not persisted; the reading is gone
    Dropped,
}

/// One-method contract the external time-series writer implements
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn write(
        &self,
        address: &DeviceAddress,
        vehicle_id: Option<&str>,
        protocol: &str,
        reading: &Reading,
    ) -> SinkStatus;
}

/// Forward `device.reading` events into the sink until cancelled
pub fn spawn_sink_forwarder(
    bus: &EventBus,
    sink: Arc<dyn ReadingSink>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut subscription = bus.subscribe(Topic::DeviceReading);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let BusEvent::DeviceReading {
                address,
                reading,
                vehicle_id,
                ..
            } = event
            else {
                continue;
            };
            match sink
                .write(
                    &address,
                    vehicle_id.as_deref(),
                    &reading.protocol,
                    &reading,
                )
                .await
            {
                SinkStatus::Ok => {}
                SinkStatus::Deferred => debug!("Sink deferred reading from {}", address),
                SinkStatus::Dropped => warn!("Sink dropped reading from {}", address),
            }
        }
    })
}
