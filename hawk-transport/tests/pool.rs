//! Connection pool integration tests against the mock transport

use std::sync::Arc;
use std::time::Duration;

use hawk_transport::mock::MockTransport;
use hawk_transport::{
    ConnectionPool, ConnectionState, DeviceAddress, PoolConfig, TransportError,
};
use uuid::Uuid;

fn addr(last: u8) -> DeviceAddress {
    format!("AA:BB:CC:DD:EE:{last:02X}").parse().unwrap()
}

fn pool_with(
    config: PoolConfig,
) -> (Arc<MockTransport>, Arc<ConnectionPool>) {
    let transport = Arc::new(MockTransport::new());
    let pool = ConnectionPool::new(transport.clone(), config);
    (transport, pool)
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let (transport, pool) = pool_with(PoolConfig::default());
    transport.set_connect_delay(Duration::from_millis(100));
    let a = addr(1);

    let mut joins = Vec::new();
    for _ in 0..5 {
        let pool = pool.clone();
        let a = a.clone();
        joins.push(tokio::spawn(async move { pool.get_or_connect(&a).await }));
    }

    let mut handles = Vec::new();
    for join in joins {
        handles.push(join.await.unwrap().unwrap());
    }

    // Exactly one transport connect; every caller sees the same handle
    assert_eq!(transport.connect_attempts(&a), 1);
    for other in &handles[1..] {
        assert!(handles[0].same_as(other));
    }

    let stats = pool.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.connected, 1);
}

#[tokio::test(start_paused = true)]
async fn waiters_observe_shared_failure() {
    let (transport, pool) = pool_with(PoolConfig::default());
    transport.set_connect_delay(Duration::from_millis(50));
    transport.fail_connects(1);
    let a = addr(2);

    let mut joins = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        let a = a.clone();
        joins.push(tokio::spawn(async move { pool.get_or_connect(&a).await }));
    }
    for join in joins {
        assert!(matches!(
            join.await.unwrap(),
            Err(TransportError::Timeout)
        ));
    }
    assert_eq!(transport.connect_attempts(&a), 1);
    assert_eq!(pool.current_state(&a), ConnectionState::Error);
    assert_eq!(pool.stats().pending, 0);
}

#[tokio::test(start_paused = true)]
async fn cap_parks_second_device_until_slot_frees() {
    let (_transport, pool) = pool_with(PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    });
    let a = addr(3);
    let b = addr(4);

    pool.get_or_connect(&a).await.unwrap();

    let parked = {
        let pool = pool.clone();
        let b = b.clone();
        tokio::spawn(async move { pool.get_or_connect(&b).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().queued, 1);
    assert!(!parked.is_finished());

    pool.disconnect(&a).await.unwrap();
    let handle = parked.await.unwrap().unwrap();
    assert_eq!(handle.address(), &b);
    assert_eq!(pool.stats().queued, 0);
}

#[tokio::test(start_paused = true)]
async fn admission_queue_overflow_rejects_newest() {
    let (_transport, pool) = pool_with(PoolConfig {
        max_connections: 1,
        queue_bound: 1,
        ..PoolConfig::default()
    });

    pool.get_or_connect(&addr(5)).await.unwrap();

    let parked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_or_connect(&addr(6)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().queued, 1);

    let err = pool.get_or_connect(&addr(7)).await.unwrap_err();
    assert!(matches!(err, TransportError::CapacityExceeded { .. }));

    // The parked caller is unaffected by the rejection
    pool.disconnect(&addr(5)).await.unwrap();
    parked.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_stop_notify_are_idempotent() {
    let (transport, pool) = pool_with(PoolConfig::default());
    let a = addr(8);
    let characteristic = Uuid::from_u128(0xFFF4);

    pool.get_or_connect(&a).await.unwrap();
    pool.start_notify(&a, characteristic, Arc::new(|_, _, _| {}))
        .await
        .unwrap();
    assert!(transport.is_subscribed(&a, characteristic));

    pool.stop_notify(&a, characteristic).await.unwrap();
    pool.stop_notify(&a, characteristic).await.unwrap();

    pool.disconnect(&a).await.unwrap();
    pool.disconnect(&a).await.unwrap();
    assert_eq!(pool.current_state(&a), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn sweep_collects_dead_links_with_subscriptions() {
    let (transport, pool) = pool_with(PoolConfig::default());
    let a = addr(9);
    let characteristic = Uuid::from_u128(0xFFF4);

    pool.get_or_connect(&a).await.unwrap();
    pool.start_notify(&a, characteristic, Arc::new(|_, _, _| {}))
        .await
        .unwrap();

    transport.drop_link(&a);
    let drops = pool.sweep().await;
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].address, a);
    assert_eq!(drops[0].subscriptions.len(), 1);

    assert_eq!(pool.current_state(&a), ConnectionState::Reconnecting);
    assert_eq!(pool.stats().active, 0);

    // Healthy links are left alone
    assert!(pool.sweep().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cap_is_never_exceeded_under_load() {
    let (transport, pool) = pool_with(PoolConfig {
        max_connections: 2,
        ..PoolConfig::default()
    });
    transport.set_connect_delay(Duration::from_millis(20));

    let mut joins = Vec::new();
    for i in 10..16 {
        let pool = pool.clone();
        joins.push(tokio::spawn(async move {
            let a = addr(i);
            let _ = pool.get_or_connect(&a).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool.disconnect(&a).await.unwrap();
        }));
    }

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pool.stats().active <= 2);
    }
    for join in joins {
        join.await.unwrap();
    }
}
