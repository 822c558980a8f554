//! Reconnection controller
//!
//! Re-establishes links the sweeper found dead: bounded exponential backoff
//! with jitter, a per-device attempt budget, and re-installation of every
//! subscription that was live at drop time before the device is handed back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::pool::{ConnectionPool, LinkDrop};
use crate::types::DeviceAddress;

/// Backoff shape for reconnect attempts
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Connect attempts before giving up into terminal `ERROR`
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Ceiling on any computed delay
    pub max_delay: Duration,
    /// Exponential growth factor
    pub multiplier: f64,
    /// Uniform jitter as a fraction of the computed delay (± either side)
    pub jitter_factor: f64,
    /// Pause between the drop and the first attempt
    pub post_drop_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.1,
            post_drop_delay: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failure (zero-based):
    /// `min(max_delay, initial_delay * multiplier^attempt)` with ± jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if self.jitter_factor <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let spread = capped * self.jitter_factor;
        let jittered = rand::thread_rng().gen_range((capped - spread).max(0.0)..=capped + spread);
        Duration::from_secs_f64(jittered)
    }
}

/// Result of one controller run, reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Link re-established and subscriptions re-installed
    Reestablished {
        /// The recovered device
        address: DeviceAddress,
    },
    /// Attempt budget exhausted; device is in terminal `ERROR`
    GaveUp {
        /// The abandoned device
        address: DeviceAddress,
    },
}

/// Per-device reconnect task manager
pub struct ReconnectController {
    pool: Arc<ConnectionPool>,
    default_policy: BackoffPolicy,
    tasks: Mutex<HashMap<DeviceAddress, CancellationToken>>,
    outcome_tx: mpsc::Sender<ReconnectOutcome>,
}

impl ReconnectController {
    /// Returns the controller and the stream of outcomes it produces
    pub fn new(
        pool: Arc<ConnectionPool>,
        default_policy: BackoffPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<ReconnectOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(32);
        (
            Arc::new(Self {
                pool,
                default_policy,
                tasks: Mutex::new(HashMap::new()),
                outcome_tx,
            }),
            outcome_rx,
        )
    }

    /// Arm reconnection for a dropped link using the default policy
    pub fn schedule(self: &Arc<Self>, link_drop: LinkDrop) {
        self.schedule_with_policy(link_drop, self.default_policy.clone());
    }

    /// Arm reconnection with a device-specific policy.
    ///
    /// A device with a run already in flight keeps the existing run.
    pub fn schedule_with_policy(self: &Arc<Self>, link_drop: LinkDrop, policy: BackoffPolicy) {
        let address = link_drop.address.clone();
        let cancel = {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&address) {
                debug!("Reconnect for {} already armed", address);
                return;
            }
            let cancel = CancellationToken::new();
            tasks.insert(address.clone(), cancel.clone());
            cancel
        };

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.run(link_drop, policy, cancel.clone()).await;
            // A cancelled run was already evicted (and possibly replaced)
            if !cancel.is_cancelled() {
                controller.tasks.lock().remove(&address);
            }
        });
    }

    /// Cancel the reconnect run for one device, if any.
    ///
    /// Called when the device is removed or an operator disconnects it.
    pub fn cancel(&self, address: &DeviceAddress) {
        if let Some(token) = self.tasks.lock().remove(address) {
            token.cancel();
            debug!("Reconnect for {} cancelled", address);
        }
    }

    /// Cancel every run (shutdown)
    pub fn cancel_all(&self) {
        for (_, token) in self.tasks.lock().drain() {
            token.cancel();
        }
    }

    /// Whether a run is in flight for the device
    pub fn is_armed(&self, address: &DeviceAddress) -> bool {
        self.tasks.lock().contains_key(address)
    }

    async fn run(&self, link_drop: LinkDrop, policy: BackoffPolicy, cancel: CancellationToken) {
        let address = link_drop.address.clone();

        for attempt in 0..policy.max_attempts {
            // First attempt fires after the post-drop pause; every later one
            // backs off from the previous failure
            let wait = if attempt == 0 {
                policy.post_drop_delay
            } else {
                policy.delay(attempt - 1)
            };
            debug!(
                "Reconnect attempt {}/{} for {} in {:?}",
                attempt + 1,
                policy.max_attempts,
                address,
                wait
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if cancel.is_cancelled() {
                return;
            }

            match self.pool.get_or_connect(&address).await {
                Ok(_handle) => {
                    if self.reinstall(&address, &link_drop).await {
                        info!(
                            "Reconnected {} after {} attempt(s)",
                            address,
                            attempt + 1
                        );
                        let _ = self
                            .outcome_tx
                            .send(ReconnectOutcome::Reestablished {
                                address: address.clone(),
                            })
                            .await;
                        return;
                    }
                    // Subscriptions would not come back; count as a failed
                    // attempt and retry from a clean link
                    let _ = self.pool.disconnect(&address).await;
                }
                Err(e) if e.is_fatal() => {
                    warn!("Reconnect of {} hit fatal error: {}", address, e);
                    break;
                }
                Err(e) => {
                    debug!("Reconnect attempt for {} failed: {}", address, e);
                }
            }
        }

        warn!(
            "Giving up on {} after {} attempt(s)",
            address, policy.max_attempts
        );
        self.pool.mark_error(&address, "reconnect attempts exhausted");
        let _ = self
            .outcome_tx
            .send(ReconnectOutcome::GaveUp { address })
            .await;
    }

    async fn reinstall(&self, address: &DeviceAddress, link_drop: &LinkDrop) -> bool {
        for (characteristic, handler) in &link_drop.subscriptions {
            if let Err(e) = self
                .pool
                .start_notify(address, *characteristic, handler.clone())
                .await
            {
                warn!(
                    "Re-subscribe {} on {} failed: {}",
                    characteristic, address, e
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_sequence_is_bounded_exponential() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter_factor: 0.0,
            post_drop_delay: Duration::ZERO,
        };
        let secs: Vec<u64> = (0..10).map(|k| policy.delay(k).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = BackoffPolicy {
            jitter_factor: 0.1,
            ..BackoffPolicy::default()
        };
        for attempt in 0..8 {
            let nominal = Duration::from_secs_f64(
                (policy.initial_delay.as_secs_f64() * policy.multiplier.powi(attempt as i32))
                    .min(policy.max_delay.as_secs_f64()),
            );
            for _ in 0..50 {
                let d = policy.delay(attempt).as_secs_f64();
                let n = nominal.as_secs_f64();
                assert!(d >= n * 0.9 - f64::EPSILON && d <= n * 1.1 + f64::EPSILON);
            }
        }
    }
}
