//! Integration tests for the call state machine: invite, ring, answer,
//! decline, hangup, timeout and audio relay.

use bytes::Bytes;
use intercom_integration_tests::{start_broker, start_broker_with_events, test_config, TestDevice};
use intercom_proto::broker::{BrokerErrorCode, BrokerMessageType};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Happy path (scenario S1)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_call_invite_answer_audio_hangup() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    // INVITE "B" -> B receives RING with the caller id, NUL-terminated
    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, ring_payload) = b.recv_until(BrokerMessageType::Ring).await;
    assert_eq!(ring.call_id, 1);
    assert_eq!(&ring_payload[..], b"A\x00");

    // B answers -> A receives ANSWER for the same call
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    let (answer, _) = a.recv_until(BrokerMessageType::Answer).await;
    assert_eq!(answer.call_id, 1);

    // Audio relays verbatim: same seq, same payload
    let pcm: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    a.send(BrokerMessageType::Audio, 1, 7, &pcm).await;
    let (audio, relayed) = b.recv_until(BrokerMessageType::Audio).await;
    assert_eq!(audio.call_id, 1);
    assert_eq!(audio.seq, 7);
    assert_eq!(&relayed[..], &pcm[..]);

    // Hangup -> B receives BYE
    a.send(BrokerMessageType::Hangup, 1, 0, &[]).await;
    let (bye, _) = b.recv_until(BrokerMessageType::Bye).await;
    assert_eq!(bye.call_id, 1);

    // Audio on the dead call id no longer routes
    a.send(BrokerMessageType::Audio, 1, 8, &pcm).await;
    b.send(BrokerMessageType::Ping, 0, 0, &[]).await;
    let (pong, _) = b.recv_until(BrokerMessageType::Pong).await;
    assert_eq!(pong.msg_type, BrokerMessageType::Pong);

    broker.stop().await;
}

#[tokio::test]
async fn test_audio_preserves_sender_order_and_seq() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    for seq in 1..=5u32 {
        let pcm = [seq as u8; 512];
        a.send(BrokerMessageType::Audio, ring.call_id, seq, &pcm).await;
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let (header, payload) = b.recv_until(BrokerMessageType::Audio).await;
        assert_eq!(payload[0] as u32, header.seq);
        seen.push(header.seq);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);

    broker.stop().await;
}

#[tokio::test]
async fn test_audio_both_directions() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    a.send(BrokerMessageType::Audio, ring.call_id, 1, &[0xAA; 512]).await;
    b.send(BrokerMessageType::Audio, ring.call_id, 1, &[0xBB; 512]).await;

    let (_, to_b) = b.recv_until(BrokerMessageType::Audio).await;
    let (_, to_a) = a.recv_until(BrokerMessageType::Audio).await;
    assert_eq!(to_b[0], 0xAA);
    assert_eq!(to_a[0], 0xBB);

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Policy errors (scenarios S2, S3)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invite_unknown_target_not_found() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"Z").await;
    let (err, payload) = a.recv_until(BrokerMessageType::Error).await;
    assert_eq!(err.call_id, 0);
    assert_eq!(payload[0], BrokerErrorCode::NotFound as u8);

    // no call was created: A can still invite successfully later
    assert!(!broker.is_device_in_call("A").await);

    broker.stop().await;
}

#[tokio::test]
async fn test_invite_busy_target() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    let mut c = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;
    c.register("C").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    // C invites A, who is mid-call
    c.send(BrokerMessageType::Invite, 0, 0, b"A").await;
    let (err, payload) = c.recv_until(BrokerMessageType::Error).await;
    assert_eq!(err.call_id, 0);
    assert_eq!(payload[0], BrokerErrorCode::Busy as u8);

    assert!(broker.is_device_in_call("A").await);
    assert!(broker.is_device_in_call("B").await);
    assert!(!broker.is_device_in_call("C").await);

    broker.stop().await;
}

#[tokio::test]
async fn test_invite_while_already_in_call_is_busy() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    let mut c = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;
    c.register("C").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    b.recv_until(BrokerMessageType::Ring).await;

    // caller is RINGING with B, so inviting C must fail with BUSY
    a.send(BrokerMessageType::Invite, 0, 0, b"C").await;
    let (_, payload) = a.recv_until(BrokerMessageType::Error).await;
    assert_eq!(payload[0], BrokerErrorCode::Busy as u8);

    broker.stop().await;
}

#[tokio::test]
async fn test_invite_from_unregistered_is_protocol_error() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut anon = TestDevice::connect(addr).await;

    anon.send(BrokerMessageType::Invite, 0, 0, b"A").await;
    let (err, payload) = anon.recv_until(BrokerMessageType::Error).await;
    assert_eq!(err.call_id, 0);
    assert_eq!(payload[0], BrokerErrorCode::Protocol as u8);

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Decline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_decline_rejected_reaches_caller() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;

    b.send(BrokerMessageType::Decline, ring.call_id, 0, &[0x01]).await;
    let (decline, payload) = a.recv_until(BrokerMessageType::Decline).await;
    assert_eq!(decline.call_id, ring.call_id);
    assert_eq!(payload[0], 0x01);

    // both sides are free again
    assert!(!broker.is_device_in_call("A").await);
    assert!(!broker.is_device_in_call("B").await);

    broker.stop().await;
}

#[tokio::test]
async fn test_decline_empty_payload_means_busy() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;

    b.send(BrokerMessageType::Decline, ring.call_id, 0, &[]).await;
    let (_, payload) = a.recv_until(BrokerMessageType::Decline).await;
    assert_eq!(payload[0], 0x00);

    broker.stop().await;
}

#[tokio::test]
async fn test_decline_by_caller_is_ignored() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;

    // only the callee may decline; the call keeps ringing
    a.send(BrokerMessageType::Decline, ring.call_id, 0, &[0x01]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.is_device_in_call("B").await);

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Answer policing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_answer_from_non_callee_is_ignored() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    let mut c = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;
    c.register("C").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;

    // neither the caller nor a third party can answer
    a.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    c.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the real callee still can
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    let (answer, _) = a.recv_until(BrokerMessageType::Answer).await;
    assert_eq!(answer.call_id, ring.call_id);

    broker.stop().await;
}

#[tokio::test]
async fn test_answer_unknown_call_is_ignored() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    a.send(BrokerMessageType::Answer, 99, 0, &[]).await;
    // connection survives
    a.send(BrokerMessageType::Ping, 0, 0, &[]).await;
    a.recv_until(BrokerMessageType::Pong).await;

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Ring timeout (scenario S4)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ring_timeout_notifies_both_parties() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;

    // nobody answers; the 300 ms test timeout fires
    let (err, payload) = a.recv_until(BrokerMessageType::Error).await;
    assert_eq!(err.call_id, ring.call_id);
    assert_eq!(payload[0], BrokerErrorCode::Timeout as u8);
    let (bye_a, _) = a.recv_until(BrokerMessageType::Bye).await;
    assert_eq!(bye_a.call_id, ring.call_id);
    let (bye_b, _) = b.recv_until(BrokerMessageType::Bye).await;
    assert_eq!(bye_b.call_id, ring.call_id);

    assert!(!broker.is_device_in_call("A").await);
    assert!(!broker.is_device_in_call("B").await);

    broker.stop().await;
}

#[tokio::test]
async fn test_answer_cancels_ring_timeout() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    // well past the 300 ms ring timeout the call must still be alive
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(broker.is_device_in_call("A").await);
    assert!(broker.is_device_in_call("B").await);

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Audio gating and peer-disconnect teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_audio_while_ringing_is_dropped() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;

    // frames sent before ANSWER never reach the callee
    a.send(BrokerMessageType::Audio, ring.call_id, 1, &[0xEE; 512]).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;
    a.send(BrokerMessageType::Audio, ring.call_id, 2, &[0xDD; 512]).await;

    let (audio, payload) = b.recv_until(BrokerMessageType::Audio).await;
    assert_eq!(audio.seq, 2);
    assert_eq!(payload[0], 0xDD);

    broker.stop().await;
}

#[tokio::test]
async fn test_peer_disconnect_ends_call_with_bye() {
    let (broker, addr, mut events) = start_broker_with_events(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    drop(b);
    let (bye, _) = a.recv_until(BrokerMessageType::Bye).await;
    assert_eq!(bye.call_id, ring.call_id);

    intercom_integration_tests::expect_event(
        &mut events,
        &intercom_broker::Event::CallDown { call_id: ring.call_id },
    )
    .await;
    assert!(!broker.is_device_in_call("A").await);

    broker.stop().await;
}

#[tokio::test]
async fn test_call_ids_increase_across_calls() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (first, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Decline, first.call_id, 0, &[0x01]).await;
    a.recv_until(BrokerMessageType::Decline).await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (second, _) = b.recv_until(BrokerMessageType::Ring).await;
    assert!(second.call_id > first.call_id);

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Framing violations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_oversized_payload_closes_connection() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    // header announcing 4097 payload bytes
    let mut bad = [0u8; 12];
    bad[0] = BrokerMessageType::Audio as u8;
    bad[2..4].copy_from_slice(&4097u16.to_le_bytes());
    a.send_raw(&bad).await;

    a.expect_closed().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_unknown_message_type_is_skipped() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    a.register("A").await;

    // unknown type 0x42 with a 3-byte payload; connection must survive
    let mut unknown = [0u8; 15];
    unknown[0] = 0x42;
    unknown[2..4].copy_from_slice(&3u16.to_le_bytes());
    a.send_raw(&unknown).await;

    a.send(BrokerMessageType::Ping, 0, 0, &[]).await;
    a.recv_until(BrokerMessageType::Pong).await;

    broker.stop().await;
}

// ---------------------------------------------------------------------------
// Backpressure (scenario S5, observable half)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_burst_of_audio_is_relayed_in_order() {
    let (broker, addr) = start_broker(test_config()).await;
    let mut a = TestDevice::connect(addr).await;
    let mut b = TestDevice::connect(addr).await;
    a.register("A").await;
    b.register("B").await;

    a.send(BrokerMessageType::Invite, 0, 0, b"B").await;
    let (ring, _) = b.recv_until(BrokerMessageType::Ring).await;
    b.send(BrokerMessageType::Answer, ring.call_id, 0, &[]).await;
    a.recv_until(BrokerMessageType::Answer).await;

    // a reading peer keeps up with a 20-frame burst; whatever arrives is a
    // contiguous suffix-preserving subsequence in seq order (the
    // drop-oldest property itself is pinned down in the queue unit tests)
    for seq in 1..=20u32 {
        a.send(BrokerMessageType::Audio, ring.call_id, seq, &Bytes::from(vec![seq as u8; 512]))
            .await;
    }

    let mut prev = 0u32;
    let mut got = 0usize;
    while got < 20 {
        let (header, _) = b.recv_until(BrokerMessageType::Audio).await;
        assert!(header.seq > prev, "reordered frame: {} after {prev}", header.seq);
        prev = header.seq;
        got += 1;
        if prev == 20 {
            break;
        }
    }
    assert_eq!(prev, 20, "final frame of the burst must survive");

    broker.stop().await;
}
