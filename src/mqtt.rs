//! MQTT resilience client
//!
//! Reconnecting publisher over rumqttc. While the broker is unreachable,
//! outbound messages collect in a bounded drop-oldest queue; a worker
//! drains it in order once the link is back. Connect attempts back off
//! exponentially; past the retry budget the client goes `FAILED` and stays
//! there until an operator re-enables it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hawk_monitor::{ProtocolFamily, Reading, RuntimeStatus};
use hawk_transport::{BackoffPolicy, DeviceAddress};

use crate::bus::{BusEvent, EventBus, Topic};
use crate::config::MqttConfig;
use crate::registry::VehicleSummary;

/// Connection lifecycle of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MqttState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until an operator calls `re_enable`
    Failed,
}

/// Counters surfaced on the health endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct MqttStats {
    pub state: MqttState,
    pub total_connections: u64,
    pub total_reconnections: u64,
    pub messages_published: u64,
    pub messages_queued: u64,
    pub messages_failed: u64,
    pub consecutive_failures: u32,
    pub queue_size: usize,
    pub last_attempt: Option<DateTime<Utc>>,
}

/// One outbound message with its retry budget
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub retries: u32,
}

/// Bounded FIFO with drop-oldest overflow
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a message; returns the evicted oldest entry on overflow
    pub fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Put a message back at the head, preserving publish order
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        self.entries.push_front(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    total_reconnections: AtomicU64,
    messages_published: AtomicU64,
    messages_queued: AtomicU64,
    messages_failed: AtomicU64,
    consecutive_failures: AtomicU32,
}

struct MqttShared {
    config: MqttConfig,
    state: Mutex<MqttState>,
    queue: Mutex<MessageQueue>,
    queue_notify: Notify,
    re_enable: Notify,
    counters: Counters,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
    shutdown_grace: Duration,
}

impl MqttShared {
    fn set_state(&self, state: MqttState) {
        let mut current = self.state.lock();
        if *current != state {
            info!("MQTT client: {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.config.max_retries,
            initial_delay: Duration::from_secs(self.config.initial_retry_delay_s),
            max_delay: Duration::from_secs(self.config.max_retry_delay_s),
            multiplier: self.config.backoff_multiplier,
            jitter_factor: self.config.jitter_factor,
            post_drop_delay: Duration::ZERO,
        }
    }
}

/// Reconnecting MQTT publisher
pub struct MqttClient {
    shared: Arc<MqttShared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

enum SessionEnd {
    Cancelled,
    LinkLost,
}

impl MqttClient {
    pub fn new(config: MqttConfig, shutdown_grace: Duration) -> Arc<Self> {
        let queue = MessageQueue::new(config.message_queue_size);
        Arc::new(Self {
            shared: Arc::new(MqttShared {
                config,
                state: Mutex::new(MqttState::Disconnected),
                queue: Mutex::new(queue),
                queue_notify: Notify::new(),
                re_enable: Notify::new(),
                counters: Counters::default(),
                last_attempt: Mutex::new(None),
                shutdown_grace,
            }),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the connection worker
    pub fn start(self: &Arc<Self>) {
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            connection_task(shared, cancel).await;
        });
        *self.worker.lock() = Some(handle);
    }

    pub fn state(&self) -> MqttState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> MqttStats {
        let c = &self.shared.counters;
        MqttStats {
            state: *self.shared.state.lock(),
            total_connections: c.total_connections.load(Ordering::SeqCst),
            total_reconnections: c.total_reconnections.load(Ordering::SeqCst),
            messages_published: c.messages_published.load(Ordering::SeqCst),
            messages_queued: c.messages_queued.load(Ordering::SeqCst),
            messages_failed: c.messages_failed.load(Ordering::SeqCst),
            consecutive_failures: c.consecutive_failures.load(Ordering::SeqCst),
            queue_size: self.shared.queue.lock().len(),
            last_attempt: *self.shared.last_attempt.lock(),
        }
    }

    /// Queue a message for publication; never blocks.
    ///
    /// A full queue evicts its oldest message, which counts as failed.
    pub fn enqueue(&self, topic: String, qos: QoS, retain: bool, payload: Vec<u8>) {
        let evicted = self.shared.queue.lock().push(QueuedMessage {
            topic,
            payload,
            qos,
            retain,
            retries: 0,
        });
        self.shared
            .counters
            .messages_queued
            .fetch_add(1, Ordering::SeqCst);
        if let Some(old) = evicted {
            warn!("MQTT queue full, dropped oldest message for {}", old.topic);
            self.shared
                .counters
                .messages_failed
                .fetch_add(1, Ordering::SeqCst);
        }
        self.shared.queue_notify.notify_one();
    }

    /// Leave `FAILED` and start connecting again
    pub fn re_enable(&self) {
        info!("MQTT client re-enabled by operator");
        self.shared.re_enable.notify_one();
    }

    /// Stop the worker, flushing the queue within the grace period
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let grace = self.shared.shutdown_grace + Duration::from_secs(2);
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("MQTT worker did not stop within the grace period");
            }
        }
        self.shared.set_state(MqttState::Disconnected);
    }
}

async fn connection_task(shared: Arc<MqttShared>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        shared.set_state(if ever_connected {
            MqttState::Reconnecting
        } else {
            MqttState::Connecting
        });
        *shared.last_attempt.lock() = Some(Utc::now());

        let mut options = MqttOptions::new(
            format!("battery-hawk-{}", std::process::id()),
            shared.config.broker.clone(),
            shared.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&shared.config.username, &shared.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(
                Duration::from_secs(shared.config.connection_timeout_s),
                wait_for_connack(&mut eventloop),
            ) => matches!(result, Ok(Ok(()))),
        };

        if !connected {
            shared
                .counters
                .consecutive_failures
                .fetch_add(1, Ordering::SeqCst);
            attempt += 1;
            if attempt >= shared.config.max_retries {
                warn!(
                    "MQTT broker unreachable after {} attempts, giving up",
                    attempt
                );
                shared.set_state(MqttState::Failed);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.re_enable.notified() => {
                        attempt = 0;
                        shared
                            .counters
                            .consecutive_failures
                            .store(0, Ordering::SeqCst);
                        continue;
                    }
                }
            }
            let delay = shared.backoff().delay(attempt - 1);
            debug!("MQTT connect failed, retrying in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        attempt = 0;
        ever_connected = true;
        shared
            .counters
            .total_connections
            .fetch_add(1, Ordering::SeqCst);
        shared
            .counters
            .consecutive_failures
            .store(0, Ordering::SeqCst);
        shared.set_state(MqttState::Connected);

        match run_connected(&shared, &client, &mut eventloop, &cancel).await {
            SessionEnd::Cancelled => break,
            SessionEnd::LinkLost => {
                shared
                    .counters
                    .total_reconnections
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn run_connected(
    shared: &Arc<MqttShared>,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    cancel: &CancellationToken,
) -> SessionEnd {
    let health_interval = Duration::from_secs(shared.config.health_check_interval_s.max(1));
    let mut health = tokio::time::interval_at(Instant::now() + health_interval, health_interval);
    let mut last_event = Instant::now();

    loop {
        drain_queue(shared, client);

        tokio::select! {
            _ = cancel.cancelled() => {
                flush_with_grace(shared, client, eventloop).await;
                return SessionEnd::Cancelled;
            }
            event = eventloop.poll() => match event {
                Ok(_) => last_event = Instant::now(),
                Err(e) => {
                    warn!("MQTT connection lost: {}", e);
                    return SessionEnd::LinkLost;
                }
            },
            _ = shared.queue_notify.notified() => {}
            _ = health.tick() => {
                // Keep-alive traffic flows through poll(); a silent loop
                // means the link is dead even if the socket is not
                if last_event.elapsed() > 2 * health_interval {
                    warn!("MQTT liveness check failed");
                    return SessionEnd::LinkLost;
                }
            }
        }
    }
}

/// Hand queued messages to the client channel, oldest first.
///
/// Stops on a full channel (the event loop will make room) or on an error
/// that consumes one of the message's retries.
fn drain_queue(shared: &Arc<MqttShared>, client: &AsyncClient) {
    loop {
        let Some(message) = shared.queue.lock().pop() else {
            return;
        };
        match client.try_publish(
            message.topic.as_str(),
            message.qos,
            message.retain,
            message.payload.clone(),
        ) {
            Ok(()) => {
                shared
                    .counters
                    .messages_published
                    .fetch_add(1, Ordering::SeqCst);
            }
            Err(ClientError::TryRequest(_)) => {
                // Channel full; keep order and let poll() drain it
                shared.queue.lock().requeue_front(message);
                return;
            }
            Err(e) => {
                let mut message = message;
                message.retries += 1;
                if message.retries > shared.config.message_retry_limit {
                    warn!(
                        "Dropping message for {} after {} retries: {}",
                        message.topic, message.retries - 1, e
                    );
                    shared
                        .counters
                        .messages_failed
                        .fetch_add(1, Ordering::SeqCst);
                } else {
                    shared.queue.lock().requeue_front(message);
                }
                return;
            }
        }
    }
}

async fn flush_with_grace(
    shared: &Arc<MqttShared>,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
) {
    let deadline = Instant::now() + shared.shutdown_grace;
    debug!(
        "Flushing {} queued MQTT messages",
        shared.queue.lock().len()
    );
    while Instant::now() < deadline {
        drain_queue(shared, client);
        if shared.queue.lock().is_empty() {
            // Let the event loop push the final packets to the socket
            let settle = Instant::now() + Duration::from_millis(250);
            while Instant::now() < settle {
                if tokio::time::timeout_at(settle, eventloop.poll())
                    .await
                    .map_or(true, |r| r.is_err())
                {
                    break;
                }
            }
            return;
        }
        match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Ok(Ok(_)) => {}
            _ => return,
        }
    }
}

// ============================================================================
// Topic scheme and payloads
// ============================================================================

fn iso_millis(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Bridge bus events onto the broker topic scheme
pub fn spawn_bus_bridge(
    bus: &EventBus,
    client: Arc<MqttClient>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let prefix = client.shared.config.topic_prefix.clone();
    let mut readings = bus.subscribe(Topic::DeviceReading);
    let mut statuses = bus.subscribe(Topic::DeviceStatus);
    let mut summaries = bus.subscribe(Topic::VehicleSummary);
    let mut discovered = bus.subscribe(Topic::DeviceDiscovered);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = readings.recv() => event,
                event = statuses.recv() => event,
                event = summaries.recv() => event,
                event = discovered.recv() => event,
            };
            let Some(event) = event else { break };
            match event {
                BusEvent::DeviceReading {
                    address,
                    reading,
                    vehicle_id,
                    family,
                } => client.enqueue(
                    format!("{prefix}/device/{address}/reading"),
                    QoS::AtLeastOnce,
                    false,
                    reading_payload(&address, &reading, vehicle_id.as_deref(), family),
                ),
                BusEvent::DeviceStatus { address, status } => client.enqueue(
                    format!("{prefix}/device/{address}/status"),
                    QoS::AtLeastOnce,
                    true,
                    status_payload(&address, &status),
                ),
                BusEvent::VehicleSummary {
                    vehicle_id,
                    summary,
                } => client.enqueue(
                    format!("{prefix}/vehicle/{vehicle_id}/summary"),
                    QoS::AtLeastOnce,
                    true,
                    summary_payload(&summary),
                ),
                BusEvent::DeviceDiscovered {
                    address,
                    local_name,
                    family,
                } => client.enqueue(
                    format!("{prefix}/discovery/found"),
                    QoS::AtLeastOnce,
                    false,
                    discovery_payload(&address, local_name.as_deref(), family),
                ),
                _ => {}
            }
        }
    })
}

impl MqttClient {
    /// Publish the retained system status document
    pub fn publish_system_status(&self, doc: serde_json::Value) {
        let topic = format!("{}/system/status", self.shared.config.topic_prefix);
        self.enqueue(topic, QoS::ExactlyOnce, true, doc.to_string().into_bytes());
    }
}

fn reading_payload(
    address: &DeviceAddress,
    reading: &Reading,
    vehicle_id: Option<&str>,
    family: ProtocolFamily,
) -> Vec<u8> {
    let mut doc = json!({
        "device_id": address.to_string(),
        "timestamp": iso_millis(reading.timestamp),
        "voltage": reading.voltage,
        "current": reading.current,
        "temperature": reading.temperature,
        "state_of_charge": reading.state_of_charge,
        "power": reading.power(),
        "device_type": family.protocol_tag(),
    });
    let map = doc.as_object_mut().expect("object literal");
    if let Some(capacity) = reading.capacity {
        map.insert("capacity".into(), json!(capacity));
    }
    if let Some(cycles) = reading.cycles {
        map.insert("cycles".into(), json!(cycles));
    }
    if let Some(vehicle_id) = vehicle_id {
        map.insert("vehicle_id".into(), json!(vehicle_id));
    }
    if !reading.extra.is_empty() {
        map.insert("extra".into(), json!(reading.extra));
    }
    doc.to_string().into_bytes()
}

fn status_payload(address: &DeviceAddress, status: &RuntimeStatus) -> Vec<u8> {
    let mut doc = json!({
        "device_id": address.to_string(),
        "timestamp": iso_millis(Utc::now()),
        "connected": status.connected,
    });
    let map = doc.as_object_mut().expect("object literal");
    if let Some(v) = &status.protocol_version {
        map.insert("protocol_version".into(), json!(v));
    }
    if let Some(v) = &status.last_command {
        map.insert("last_command".into(), json!(v));
    }
    if let Some(v) = &status.error_code {
        map.insert("error_code".into(), json!(v));
    }
    if let Some(v) = &status.error_message {
        map.insert("error_message".into(), json!(v));
    }
    doc.to_string().into_bytes()
}

fn summary_payload(summary: &VehicleSummary) -> Vec<u8> {
    let mut doc = serde_json::to_value(summary).unwrap_or_default();
    if let Some(map) = doc.as_object_mut() {
        map.insert("timestamp".into(), json!(iso_millis(summary.timestamp)));
    }
    doc.to_string().into_bytes()
}

fn discovery_payload(
    address: &DeviceAddress,
    local_name: Option<&str>,
    family: ProtocolFamily,
) -> Vec<u8> {
    let mut doc = json!({
        "device_id": address.to_string(),
        "timestamp": iso_millis(Utc::now()),
        "device_type": family.protocol_tag(),
    });
    if let Some(name) = local_name {
        doc.as_object_mut()
            .expect("object literal")
            .insert("local_name".into(), json!(name));
    }
    doc.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: u8) -> QueuedMessage {
        QueuedMessage {
            topic: format!("t/{n}"),
            payload: vec![n],
            qos: QoS::AtLeastOnce,
            retain: false,
            retries: 0,
        }
    }

    #[test]
    fn queue_overflow_drops_oldest_not_newest() {
        let mut queue = MessageQueue::new(3);
        for n in 0..3 {
            assert!(queue.push(message(n)).is_none());
        }
        let evicted = queue.push(message(3)).expect("overflow evicts");
        assert_eq!(evicted.topic, "t/0");
        // Remaining order is preserved
        assert_eq!(queue.pop().unwrap().topic, "t/1");
        assert_eq!(queue.pop().unwrap().topic, "t/2");
        assert_eq!(queue.pop().unwrap().topic, "t/3");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn requeue_front_preserves_order() {
        let mut queue = MessageQueue::new(8);
        queue.push(message(0));
        queue.push(message(1));
        let head = queue.pop().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.pop().unwrap().topic, "t/0");
        assert_eq!(queue.pop().unwrap().topic, "t/1");
    }

    #[test]
    fn enqueue_tracks_counters() {
        let client = MqttClient::new(
            MqttConfig {
                message_queue_size: 2,
                ..MqttConfig::default()
            },
            Duration::from_secs(10),
        );
        for n in 0..3 {
            client.enqueue(format!("t/{n}"), QoS::AtLeastOnce, false, vec![n]);
        }
        let stats = client.stats();
        assert_eq!(stats.messages_queued, 3);
        assert_eq!(stats.queue_size, 2);
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.state, MqttState::Disconnected);
    }

    #[test]
    fn reading_payload_schema() {
        let address: DeviceAddress = "AA:BB:CC:DD:EE:01".parse().unwrap();
        let mut reading = Reading::new("bm6", 12.6, -1.5, 25.1, 85.0);
        reading.capacity = Some(60.0);
        let raw = reading_payload(&address, &reading, Some("van"), ProtocolFamily::Bm6);
        let doc: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc["device_id"], "AA:BB:CC:DD:EE:01");
        assert_eq!(doc["voltage"], 12.6);
        assert_eq!(doc["vehicle_id"], "van");
        assert_eq!(doc["capacity"], 60.0);
        assert_eq!(doc["device_type"], "bm6");
        // ISO-8601 with millisecond precision and explicit UTC
        let ts = doc["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2026-01-01T00:00:00.000Z".len());
    }
}
