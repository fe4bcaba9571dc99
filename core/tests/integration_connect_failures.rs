// Integration tests for connect outcomes
//
// Failed and timed-out connects must surface the right error and leave no
// registry entry behind; bonding and busy-radio cases must still reach Ready.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use zebraprint_core::transport::ble::{
    BondState, DeviceAddress, DeviceRegistry, GattStatus, LinkState, SimulatedBehavior,
    SimulatedRadio,
};
use zebraprint_core::{
    BleConnector, BleSocket, RadioPlatform, TimedOperation, TransportConfig, TransportError,
};

fn printer() -> DeviceAddress {
    DeviceAddress::parse("AA:BB:CC:DD:EE:FF").expect("valid address")
}

fn fast_config() -> TransportConfig {
    TransportConfig::default()
        .with_connect_timeout(Duration::from_millis(300))
        .with_bond_timeout(Duration::from_millis(800))
        .with_write_timeout(Duration::from_millis(300))
        .with_close_timeout(Duration::from_millis(200))
        .with_mtu_wait(10, Duration::from_millis(20))
        .with_settle_delays(Duration::ZERO, Duration::ZERO)
}

fn socket(radio: &SimulatedRadio, registry: &Arc<DeviceRegistry>) -> BleSocket {
    BleSocket::new(
        printer(),
        Arc::new(radio.clone()),
        registry.clone(),
        fast_config(),
    )
    .expect("valid config")
}

#[test]
fn test_connect_timeout_leaves_no_entry() {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        complete_connect: false,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    let result = s.connect();
    assert!(matches!(
        result,
        Err(TransportError::Timeout {
            operation: TimedOperation::Connect,
            ..
        })
    ));
    assert!(!s.is_open());
    assert!(registry.is_empty());

    let stats = radio.stats();
    assert_eq!(stats.disconnect_requests, 1);
    assert_eq!(stats.links_closed, 1);
    assert_eq!(radio.active_receivers(), 0);
    println!("✓ Connect timeout tore the link down");
}

#[test]
fn test_refused_connect() {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        accept_connect: false,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    assert!(matches!(
        s.connect(),
        Err(TransportError::ConnectionFailed(_))
    ));
    assert!(registry.is_empty());
    assert_eq!(radio.active_receivers(), 0);
}

/// Open one socket, then drop its link while it stays open.
fn open_then_lose_link(radio: &SimulatedRadio, registry: &Arc<DeviceRegistry>) -> BleSocket {
    let mut holder = socket(radio, registry);
    holder.connect().expect("first connect");
    assert!(radio.drop_link(&printer()));
    radio.flush();
    assert_eq!(registry.reference_count(&printer()), 1);
    holder
}

#[test]
fn test_refused_reconnect_while_other_socket_open() -> anyhow::Result<()> {
    let radio = SimulatedRadio::new();
    let registry = Arc::new(DeviceRegistry::new());
    let mut holder = open_then_lose_link(&radio, &registry);

    radio.update_behavior(|b| b.accept_connect = false);
    let mut refused = socket(&radio, &registry);
    assert!(matches!(
        refused.connect(),
        Err(TransportError::ConnectionFailed(_))
    ));
    assert!(!refused.is_open());
    assert_eq!(registry.reference_count(&printer()), 1);

    radio.update_behavior(|b| b.accept_connect = true);
    let mut retry = socket(&radio, &registry);
    retry.connect()?;
    assert_eq!(radio.stats().connect_attempts, 3);
    assert_eq!(radio.link_state(&printer()), Some(LinkState::Connected));
    assert_eq!(registry.reference_count(&printer()), 2);
    holder.write(b"~HS")?;

    retry.close();
    holder.close();
    assert!(registry.is_empty());
    println!("✓ Refused reconnect did not block the next one");
    Ok(())
}

#[test]
fn test_timed_out_reconnect_while_other_socket_open() -> anyhow::Result<()> {
    let radio = SimulatedRadio::new();
    let registry = Arc::new(DeviceRegistry::new());
    let mut holder = open_then_lose_link(&radio, &registry);
    let before = radio.stats();

    radio.update_behavior(|b| b.complete_connect = false);
    let mut stalled = socket(&radio, &registry);
    assert!(matches!(
        stalled.connect(),
        Err(TransportError::Timeout {
            operation: TimedOperation::Connect,
            ..
        })
    ));
    radio.flush();

    let after = radio.stats();
    assert_eq!(after.disconnect_requests, before.disconnect_requests + 1);
    assert_eq!(after.links_closed, before.links_closed + 1);
    assert_ne!(radio.link_state(&printer()), Some(LinkState::Connecting));
    assert!(matches!(
        holder.write(b"~HS"),
        Err(TransportError::Timeout { .. }) | Err(TransportError::ConnectionFailed(_))
    ));

    radio.update_behavior(|b| b.complete_connect = true);
    let mut retry = socket(&radio, &registry);
    retry.connect()?;
    assert_eq!(radio.link_state(&printer()), Some(LinkState::Connected));
    assert_eq!(registry.reference_count(&printer()), 2);

    retry.close();
    holder.close();
    assert!(registry.is_empty());
    println!("✓ Timed-out reconnect left no half-open link");
    Ok(())
}

#[test]
fn test_missing_service_is_protocol_error() {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        service_present: false,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    assert!(matches!(s.connect(), Err(TransportError::Protocol(_))));
    radio.flush();
    assert!(registry.is_empty());
    assert_eq!(radio.stats().links_closed, 1);
}

#[test]
fn test_failed_discovery_is_connection_error() {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        discovery_status: GattStatus::FAILURE,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    assert!(matches!(
        s.connect(),
        Err(TransportError::ConnectionFailed(_))
    ));
    radio.flush();
    assert!(registry.is_empty());
}

#[test]
fn test_bonding_completes_through_observer() -> anyhow::Result<()> {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        bond_required: true,
        bond_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    s.connect()?;
    assert_eq!(radio.bond_state(&printer()), BondState::Bonded);
    assert_eq!(radio.stats().descriptor_writes, 1);
    s.write(b"~HS")?;

    println!("✓ Subscription retried after bonding");
    Ok(())
}

#[test]
fn test_busy_descriptor_recovers_after_bond_broadcast() -> anyhow::Result<()> {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        descriptor_status: GattStatus::BUSY,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    let broadcaster = {
        let radio = radio.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            radio.broadcast_bond(&printer(), BondState::Bonded);
        })
    };

    s.connect()?;
    broadcaster.join().expect("broadcaster thread");
    assert_eq!(radio.stats().descriptor_writes, 2);
    Ok(())
}

#[test]
fn test_busy_descriptor_without_bond_times_out() {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        descriptor_status: GattStatus::BUSY,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);

    assert!(matches!(
        s.connect(),
        Err(TransportError::Timeout {
            operation: TimedOperation::Bond,
            ..
        })
    ));
    assert!(registry.is_empty());
}

#[test]
fn test_unacknowledged_disconnect_forces_removal() -> anyhow::Result<()> {
    let radio = SimulatedRadio::with_behavior(SimulatedBehavior {
        ack_disconnect: false,
        ..Default::default()
    });
    let registry = Arc::new(DeviceRegistry::new());
    let mut s = socket(&radio, &registry);
    s.connect()?;

    let started = Instant::now();
    s.close();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(registry.is_empty());
    assert_eq!(radio.stats().links_closed, 1);
    Ok(())
}

#[test]
fn test_connector_requires_platform() {
    let connector = BleConnector::new("AA:BB:CC:DD:EE:FF")
        .expect("valid address")
        .with_registry(Arc::new(DeviceRegistry::new()))
        .with_config(fast_config());

    assert!(matches!(
        connector.open(),
        Err(TransportError::Configuration(_))
    ));
}

#[test]
fn test_connector_opens_ready_socket() -> anyhow::Result<()> {
    let radio = SimulatedRadio::new();
    let registry = Arc::new(DeviceRegistry::new());
    let mut connector = BleConnector::new("aa:bb:cc:dd:ee:ff")?
        .with_registry(registry.clone())
        .with_config(fast_config().with_settle_delays(Duration::ZERO, Duration::from_millis(50)));
    connector.set_platform(Arc::new(radio.clone()));

    let started = Instant::now();
    let socket = connector.open()?;
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(socket.is_open());
    assert_eq!(registry.reference_count(&printer()), 1);

    socket.write(b"^XA^XZ")?;
    drop(socket);
    assert!(registry.is_empty());
    Ok(())
}
