//! Engine orchestrator end-to-end tests against the mock transport

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use battery_hawk::{
    BusEvent, Config, DeviceStatus, Engine, EngineHandle, MemoryStore, NewDevice, RegistryStore,
    Topic,
};
use hawk_monitor::emulator::Bm6Device;
use hawk_monitor::ProtocolFamily;
use hawk_transport::mock::MockTransport;
use hawk_transport::{DeviceAddress, DiscoveredPeripheral};

fn addr(last: u8) -> DeviceAddress {
    format!("AA:BB:CC:DD:EE:{last:02X}").parse().unwrap()
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.discovery.initial_scan = false;
    config
}

struct Rig {
    transport: Arc<MockTransport>,
    device: Arc<Mutex<Bm6Device>>,
    store: Arc<MemoryStore>,
    handle: EngineHandle,
}

async fn rig(config: Config) -> Rig {
    let transport = Arc::new(MockTransport::new());
    let device = Arc::new(Mutex::new(Bm6Device::default()));
    transport.set_responder(Bm6Device::responder(Arc::clone(&device)));
    let store = Arc::new(MemoryStore::new());
    let handle = Engine::start(config, transport.clone(), store.clone(), None)
        .await
        .unwrap();
    Rig {
        transport,
        device,
        store,
        handle,
    }
}

fn bm6(last: u8, poll_interval_s: u64) -> NewDevice {
    NewDevice {
        address: addr(last),
        family: ProtocolFamily::Bm6,
        name: Some(format!("bm6-{last}")),
        poll_interval_s: Some(poll_interval_s),
    }
}

#[tokio::test(start_paused = true)]
async fn operator_added_device_produces_readings() {
    let rig = rig(quiet_config()).await;
    let mut readings = rig.handle.subscribe(Topic::DeviceReading);

    let record = rig.handle.add_device(bm6(1, 1)).await.unwrap();
    assert_eq!(record.status, DeviceStatus::Configured);
    assert!(record.configured_at.is_some());

    let event = tokio::time::timeout(Duration::from_secs(5), readings.recv())
        .await
        .expect("a reading within one polling period")
        .unwrap();
    let BusEvent::DeviceReading {
        address, reading, ..
    } = event
    else {
        panic!("expected a reading event");
    };
    assert_eq!(address, addr(1));
    assert_eq!(reading.voltage, 12.60);
    assert_eq!(reading.state_of_charge, 85.0);

    let latest = rig.handle.latest_reading(addr(1)).await.unwrap().unwrap();
    assert_eq!(latest.voltage, 12.60);

    let health = rig.handle.health().await.unwrap();
    assert_eq!(health.device_count, 1);
    assert_eq!(health.configured_devices, 1);
    assert!(health.running);

    // The registry mutation reached the persistence contract
    let (devices, _) = rig.store.load().await.unwrap();
    assert_eq!(devices.devices.len(), 1);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn discovery_registers_but_does_not_poll() {
    let rig = rig(quiet_config()).await;
    rig.transport.set_scan_results(vec![DiscoveredPeripheral {
        address: addr(2),
        local_name: Some("BM6 Pro".into()),
        manufacturer_data: HashMap::new(),
    }]);

    let mut discovered = rig.handle.subscribe(Topic::DeviceDiscovered);
    rig.handle.start_discovery().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), discovered.recv())
        .await
        .expect("discovery event")
        .unwrap();
    let BusEvent::DeviceDiscovered {
        address, family, ..
    } = event
    else {
        panic!("expected a discovery event");
    };
    assert_eq!(address, addr(2));
    assert_eq!(family, ProtocolFamily::Bm6);

    let record = rig.handle.get_device(addr(2)).await.unwrap().unwrap();
    assert_eq!(record.status, DeviceStatus::Discovered);
    // Discovered devices are not polled until configured
    let health = rig.handle.health().await.unwrap();
    assert_eq!(health.configured_devices, 0);
    assert_eq!(rig.transport.connect_attempts(&addr(2)), 0);

    // A second scan of the same device does not duplicate the record
    rig.handle.start_discovery().await.unwrap();
    assert_eq!(rig.handle.list_devices().await.unwrap().len(), 1);

    // Configuring promotes it into the polled set
    let mut readings = rig.handle.subscribe(Topic::DeviceReading);
    let record = rig.handle.configure_device(addr(2)).await.unwrap();
    assert_eq!(record.status, DeviceStatus::Configured);
    let event = tokio::time::timeout(Duration::from_secs(90), readings.recv())
        .await
        .expect("reading after configuration")
        .unwrap();
    assert!(matches!(event, BusEvent::DeviceReading { .. }));

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn vehicle_summaries_deduplicate_identical_content() {
    let rig = rig(quiet_config()).await;
    rig.handle.add_vehicle("van", "Camper Van").await.unwrap();

    let mut summaries = rig.handle.subscribe(Topic::VehicleSummary);
    rig.handle.add_device(bm6(3, 1)).await.unwrap();
    rig.handle.associate("van", addr(3)).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), summaries.recv())
        .await
        .expect("summary after association")
        .unwrap();
    let BusEvent::VehicleSummary { vehicle_id, .. } = event else {
        panic!("expected a summary event");
    };
    assert_eq!(vehicle_id, "van");

    // Steady-state identical readings must not re-emit the summary; the
    // connect-status and unknown -> populated transitions may each add one
    tokio::time::sleep(Duration::from_secs(6)).await;
    let mut steady_state = 0;
    while summaries.try_recv().is_some() {
        steady_state += 1;
    }
    assert!(steady_state <= 2, "{steady_state} redundant summaries");

    // Content change is emitted exactly once
    rig.device.lock().voltage = 11.02;
    let event = tokio::time::timeout(Duration::from_secs(5), summaries.recv())
        .await
        .expect("summary after content change")
        .unwrap();
    let BusEvent::VehicleSummary { summary, .. } = event else {
        panic!("expected a summary event");
    };
    assert_eq!(summary.average_voltage, Some(11.02));
    assert_eq!(summary.total_devices, 1);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_reconnect_rebuilds_the_session() {
    let rig = rig(quiet_config()).await;
    let mut readings = rig.handle.subscribe(Topic::DeviceReading);
    rig.handle.add_device(bm6(4, 1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), readings.recv())
        .await
        .expect("initial reading")
        .unwrap();
    let before = rig.transport.connect_attempts(&addr(4));
    assert!(before >= 1);

    rig.handle.force_reconnect(addr(4)).await.unwrap();

    // Readings resume over a fresh link
    tokio::time::timeout(Duration::from_secs(5), readings.recv())
        .await
        .expect("reading after forced reconnect")
        .unwrap();
    assert!(rig.transport.connect_attempts(&addr(4)) > before);

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removed_device_stops_polling() {
    let rig = rig(quiet_config()).await;
    let mut readings = rig.handle.subscribe(Topic::DeviceReading);
    rig.handle.add_device(bm6(5, 1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), readings.recv())
        .await
        .expect("initial reading")
        .unwrap();

    rig.handle.remove_device(addr(5)).await.unwrap();
    assert!(rig.handle.list_devices().await.unwrap().is_empty());
    assert!(rig.handle.latest_reading(addr(5)).await.unwrap().is_none());

    while readings.try_recv().is_some() {}
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(readings.try_recv().is_none());

    rig.handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_emits_final_event_and_closes_the_bus() {
    let rig = rig(quiet_config()).await;
    let mut readings = rig.handle.subscribe(Topic::DeviceReading);
    rig.handle.add_device(bm6(6, 1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), readings.recv())
        .await
        .expect("initial reading")
        .unwrap();

    let mut shutdown_events = rig.handle.subscribe(Topic::SystemShutdown);
    rig.handle.shutdown().await;

    // The final event is system.shutdown, then the bus ends
    assert!(matches!(
        shutdown_events.recv().await,
        Some(BusEvent::SystemShutdown)
    ));
    assert!(shutdown_events.recv().await.is_none());

    // The reading stream terminates instead of hanging
    while readings.recv().await.is_some() {}

    // A frame arriving after teardown reaches no handler and no subscriber
    let delivered = rig.transport.inject_notification(
        &addr(6),
        ProtocolFamily::Bm6.notify_characteristic(),
        &hawk_monitor::emulator::bm6_realtime_frame(12.0, 20.0, 50.0),
    );
    assert!(!delivered);

    rig.handle.shutdown().await; // idempotent
}
