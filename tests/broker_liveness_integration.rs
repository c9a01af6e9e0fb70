//! Integration tests for keepalive: PING/PONG handling and idle eviction.

use intercom_broker::{BrokerConfig, Event};
use intercom_integration_tests::{
    expect_event, start_broker, start_broker_with_events, TestDevice,
};
use intercom_proto::broker::BrokerMessageType;
use std::time::Duration;

fn liveness_config() -> BrokerConfig {
    BrokerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ping_interval: Duration::from_millis(100),
        idle_timeout: Duration::from_millis(400),
        ..BrokerConfig::default()
    }
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (broker, addr) = start_broker(liveness_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    a.send(BrokerMessageType::Ping, 0, 0, &[]).await;
    let (pong, _) = a.recv_until(BrokerMessageType::Pong).await;
    assert_eq!(pong.call_id, 0);
    assert_eq!(pong.seq, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_broker_pings_idle_connections() {
    let (broker, addr) = start_broker(liveness_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    // with a 100 ms cadence a PING must show up quickly
    let (ping, _) = a.recv_until(BrokerMessageType::Ping).await;
    assert_eq!(ping.msg_type, BrokerMessageType::Ping);

    broker.stop().await;
}

#[tokio::test]
async fn test_silent_peer_is_evicted() {
    let (broker, addr, mut events) = start_broker_with_events(liveness_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;
    expect_event(&mut events, &Event::DeviceUp { id: "A".into() }).await;

    // A never answers the broker's pings; after the 400 ms idle timeout
    // the broker hangs up on it
    a.expect_closed().await;
    expect_event(&mut events, &Event::DeviceDown { id: "A".into() }).await;
    assert!(broker.connected_devices().await.is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn test_ponging_peer_survives() {
    let (broker, addr) = start_broker(liveness_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    // answer pings for ~3 idle-timeout windows
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1200);
    while tokio::time::Instant::now() < deadline {
        let (header, _) = a.recv().await;
        if header.msg_type == BrokerMessageType::Ping {
            a.send(BrokerMessageType::Pong, 0, 0, &[]).await;
        }
    }

    assert_eq!(broker.connected_devices().await, vec!["A".to_string()]);
    broker.stop().await;
}

#[tokio::test]
async fn test_eviction_mid_call_notifies_peer() {
    let (broker, addr) = start_broker(liveness_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    // B stays up by ponging; A goes silent and gets evicted, which must
    // end the call with a BYE to B
    let bye = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (header, _) = b.recv().await;
            match header.msg_type {
                BrokerMessageType::Ping => b.send(BrokerMessageType::Pong, 0, 0, &[]).await,
                BrokerMessageType::Bye => return header,
                _ => {}
            }
        }
    })
    .await
    .expect("no BYE after peer eviction");
    assert_eq!(bye.call_id, ring.call_id);
    assert!(!broker.is_device_in_call("B").await);

    broker.stop().await;
}
