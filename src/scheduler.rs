//! Poll scheduler
//!
//! One periodic driver per configured device, all funneled through a single
//! admission semaphore sized to the BLE connection cap. A driver that cannot
//! get a slot within its own polling period skips the cycle instead of
//! queueing it. Cadences are jittered at registration so fleets with equal
//! periods do not convoy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hawk_monitor::DeviceSession;
use hawk_transport::DeviceAddress;

use crate::bus::{BusEvent, EventBus};

/// Consecutive skipped cycles per device before a warning is logged
const SKIP_WARN_THRESHOLD: u32 = 3;

struct SchedShared {
    admission: Arc<Semaphore>,
    capacity: u32,
    bus: EventBus,
    drivers: Mutex<HashMap<DeviceAddress, CancellationToken>>,
    root: CancellationToken,
}

impl SchedShared {
    /// More registered devices than connection slots: links are time-shared
    fn oversubscribed(&self) -> bool {
        self.drivers.lock().len() > self.capacity as usize
    }
}

/// Cap-aware periodic poll driver set
pub struct PollScheduler {
    shared: Arc<SchedShared>,
}

/// While held, every admission slot is taken: outstanding polls have
/// drained and no new one can start. Used for discovery scans, which need
/// the adapter to themselves.
pub struct SchedulerPause {
    _permits: OwnedSemaphorePermit,
}

impl PollScheduler {
    pub fn new(capacity: usize, bus: EventBus) -> Self {
        let capacity = capacity.max(1) as u32;
        Self {
            shared: Arc::new(SchedShared {
                admission: Arc::new(Semaphore::new(capacity as usize)),
                capacity,
                bus,
                drivers: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Start (or restart) the periodic driver for a device.
    ///
    /// The first cycle is delayed by up to 10% of the period, fixed at
    /// registration time.
    pub fn register(&self, session: Arc<DeviceSession>, period: Duration) {
        let address = session.address().clone();
        let cancel = self.shared.root.child_token();
        if let Some(old) = self
            .shared
            .drivers
            .lock()
            .insert(address.clone(), cancel.clone())
        {
            old.cancel();
        }

        let shared = Arc::clone(&self.shared);
        info!("Polling {} every {:?}", address, period);
        tokio::spawn(async move {
            drive(shared, session, period, cancel).await;
        });
    }

    /// Cancel a device's driver. Pending polls die immediately; an
    /// in-flight poll runs to its command timeout and reports
    /// `PollCancelled`.
    pub fn deregister(&self, address: &DeviceAddress) {
        if let Some(token) = self.shared.drivers.lock().remove(address) {
            token.cancel();
            debug!("Poll driver for {} cancelled", address);
        }
    }

    pub fn is_registered(&self, address: &DeviceAddress) -> bool {
        self.shared.drivers.lock().contains_key(address)
    }

    /// Drain outstanding polls and block new admissions until the returned
    /// guard is dropped
    pub async fn pause(&self) -> Result<SchedulerPause, AcquireError> {
        let permits = self
            .shared
            .admission
            .clone()
            .acquire_many_owned(self.shared.capacity)
            .await?;
        debug!("Scheduler paused: all {} slots held", self.shared.capacity);
        Ok(SchedulerPause { _permits: permits })
    }

    /// Cancel every driver and refuse new admissions
    pub fn shutdown(&self) {
        self.shared.root.cancel();
        self.shared.drivers.lock().clear();
        self.shared.admission.close();
    }
}

async fn drive(
    shared: Arc<SchedShared>,
    session: Arc<DeviceSession>,
    period: Duration,
    cancel: CancellationToken,
) {
    let address = session.address().clone();

    let jitter = {
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(0.0..=period.as_secs_f64() / 10.0))
    };
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut consecutive_skips = 0u32;
    loop {
        let cycle_start = Instant::now();

        // Admission against the cap, bounded by this device's own period
        let admission = tokio::select! {
            _ = cancel.cancelled() => return,
            acquired = tokio::time::timeout(
                period,
                shared.admission.clone().acquire_owned(),
            ) => acquired,
        };
        let permit = match admission {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return, // scheduler shut down
            Err(_) => {
                // Would have blocked past the period: skip, never queue
                shared.bus.publish(BusEvent::PollSkipped {
                    address: address.clone(),
                });
                consecutive_skips += 1;
                if consecutive_skips >= SKIP_WARN_THRESHOLD {
                    warn!(
                        "{}: {} consecutive poll cycles skipped",
                        address, consecutive_skips
                    );
                }
                continue;
            }
        };
        consecutive_skips = 0;

        // In-flight work is bounded by the session's command timeout and is
        // never aborted mid-exchange
        let result = match session.open().await {
            Ok(()) => session.request_voltage_temp().await.map(|_| ()),
            Err(e) => Err(e),
        };

        // With more devices than connection slots the slot is time-shared:
        // the link comes up for the poll and goes away right after. Fleets
        // within the cap keep their links and their subscriptions warm.
        if shared.oversubscribed() {
            session.yield_link().await;
        }
        drop(permit);

        if cancel.is_cancelled() {
            shared.bus.publish(BusEvent::PollCancelled {
                address: address.clone(),
            });
            return;
        }
        if let Err(e) = result {
            debug!("Poll of {} failed: {}", address, e);
        }

        let elapsed = cycle_start.elapsed();
        if elapsed < period {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period - elapsed) => {}
            }
        }
    }
}
