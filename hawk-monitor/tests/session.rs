//! Device session integration tests against the mock transport and the
//! reference device image

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use hawk_monitor::emulator::{self, Bm6Device};
use hawk_monitor::{
    event_channel, DeviceSession, MonitorError, ProtocolFamily, SessionConfig, SessionEvent,
};
use hawk_transport::mock::MockTransport;
use hawk_transport::{ConnectionPool, DeviceAddress, PoolConfig, Transport};

fn addr() -> DeviceAddress {
    "AA:BB:CC:DD:EE:01".parse().unwrap()
}

struct Rig {
    transport: Arc<MockTransport>,
    session: DeviceSession,
    events: mpsc::Receiver<SessionEvent>,
    device: Arc<Mutex<Bm6Device>>,
}

fn rig() -> Rig {
    let transport = Arc::new(MockTransport::new());
    let device = Arc::new(Mutex::new(Bm6Device::default()));
    transport.set_responder(Bm6Device::responder(Arc::clone(&device)));

    let pool = ConnectionPool::new(transport.clone(), PoolConfig::default());
    let (tx, events) = event_channel(64);
    let session = DeviceSession::new(
        pool,
        addr(),
        ProtocolFamily::Bm6,
        SessionConfig::default(),
        tx,
    );
    Rig {
        transport,
        session,
        events,
        device,
    }
}

async fn next_reading(events: &mut mpsc::Receiver<SessionEvent>) -> Option<SessionEvent> {
    while let Some(event) = events.recv().await {
        if matches!(event, SessionEvent::Reading { .. }) {
            return Some(event);
        }
    }
    None
}

#[tokio::test(start_paused = true)]
async fn voltage_request_produces_canonical_reading() {
    let mut rig = rig();
    rig.session.open().await.unwrap();

    let reading = rig.session.request_voltage_temp().await.unwrap();
    assert_eq!(reading.voltage, 12.60);
    assert_eq!(reading.temperature, 25.1);
    assert_eq!(reading.state_of_charge, 85.0);
    assert_eq!(reading.protocol, "bm6");

    // The same reading was published as a session event
    let Some(SessionEvent::Reading { address, reading }) =
        next_reading(&mut rig.events).await
    else {
        panic!("expected a reading event");
    };
    assert_eq!(address, addr());
    assert_eq!(reading.voltage, 12.60);

    // One encrypted block went over the wire
    let writes = rig.transport.writes(&addr());
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1.len(), 16);
}

#[tokio::test(start_paused = true)]
async fn readings_are_enriched_from_cached_frames() {
    let rig = rig();
    rig.session.open().await.unwrap();

    let info = rig.session.request_basic_info().await.unwrap();
    assert_eq!(info.capacity_ah, 60.0);
    assert_eq!(info.firmware, "1.4.2");

    let cells = rig.session.request_cell_voltages().await.unwrap();
    assert_eq!(cells.len(), 4);

    let reading = rig.session.request_voltage_temp().await.unwrap();
    assert_eq!(reading.capacity, Some(60.0));
    assert_eq!(reading.cycles, Some(12));
    assert!(reading.extra.contains_key("cell_voltages"));
}

#[tokio::test(start_paused = true)]
async fn mutated_device_state_flows_through() {
    let rig = rig();
    rig.session.open().await.unwrap();

    rig.device.lock().voltage = 11.92;
    rig.device.lock().state_of_charge = 41.0;
    let reading = rig.session.request_voltage_temp().await.unwrap();
    assert_eq!(reading.voltage, 11.92);
    assert_eq!(reading.state_of_charge, 41.0);
}

#[tokio::test(start_paused = true)]
async fn timeouts_trip_reconnect_request() {
    let transport = Arc::new(MockTransport::new());
    // No responder: every request runs to its deadline
    let pool = ConnectionPool::new(transport.clone(), PoolConfig::default());
    let (tx, mut events) = event_channel(64);
    let session = DeviceSession::new(
        pool,
        addr(),
        ProtocolFamily::Bm6,
        SessionConfig {
            command_timeout: Duration::from_millis(100),
            failure_threshold: 3,
        },
        tx,
    );
    session.open().await.unwrap();

    for _ in 0..3 {
        let err = session.request_voltage_temp().await.unwrap_err();
        assert!(matches!(err, MonitorError::CommandTimeout { .. }));
    }

    let mut saw_reconnect_request = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::ReconnectRequested { .. }) {
            saw_reconnect_request = true;
        }
    }
    assert!(saw_reconnect_request);

    // The link itself survives command timeouts
    assert!(transport.is_connected(&addr()).await);
}

#[tokio::test(start_paused = true)]
async fn reading_after_close_is_parsed_but_not_published() {
    let mut rig = rig();
    rig.session.open().await.unwrap();

    // Drain the open-status event
    while rig.events.try_recv().is_ok() {}

    let (characteristic, handler) = rig.session.notification_binding();
    rig.session.close().await;

    // The frame that was already in flight when close began
    handler(
        &addr(),
        characteristic,
        &emulator::bm6_realtime_frame(12.1, 20.0, 70.0),
    );

    assert!(rig.events.try_recv().is_err());

    let err = rig.session.request_voltage_temp().await.unwrap_err();
    assert!(matches!(err, MonitorError::SessionClosed));
}

#[tokio::test(start_paused = true)]
async fn legacy_family_roundtrip() {
    let transport = Arc::new(MockTransport::new());
    let write_char = ProtocolFamily::Bm2.write_characteristic();
    let notify_char = ProtocolFamily::Bm2.notify_characteristic();
    transport.set_responder(Arc::new(move |_, characteristic, payload| {
        if characteristic != write_char || payload.len() < 3 {
            return Vec::new();
        }
        match payload[2] {
            0x03 => vec![(
                notify_char,
                emulator::legacy_basic_info_frame(13.28, -2.4, 76.0, 18.5, 100.0, 57),
            )],
            0x04 => vec![(notify_char, emulator::legacy_cell_frame(&[3312, 3308]))],
            _ => Vec::new(),
        }
    }));

    let pool = ConnectionPool::new(transport, PoolConfig::default());
    let (tx, _events) = event_channel(64);
    let session = DeviceSession::new(
        pool,
        addr(),
        ProtocolFamily::Bm2,
        SessionConfig::default(),
        tx,
    );
    session.open().await.unwrap();

    let reading = session.request_voltage_temp().await.unwrap();
    assert_eq!(reading.voltage, 13.28);
    assert_eq!(reading.current, -2.4);
    assert_eq!(reading.capacity, Some(100.0));

    let cells = session.request_cell_voltages().await.unwrap();
    assert_eq!(cells, vec![3.312, 3.308]);
}
