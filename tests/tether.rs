//! Integration coverage for the Tether Bus's ordering, independence, and
//! long-poll behavior across the public `TetherBus` API.

use std::time::Duration;

use aegis_protocol::TetherChannel;
use serde_json::json;

use aegis::tether::TetherBus;

#[tokio::test]
async fn sequence_numbers_are_monotonic_per_session() {
    let bus = TetherBus::new(64);
    let seq1 = bus
        .send("inst-a", TetherChannel::Host, "sess-1", "message".into(), None, json!({"n": 1}))
        .await;
    let seq2 = bus
        .send("inst-a", TetherChannel::Host, "sess-1", "message".into(), None, json!({"n": 2}))
        .await;
    assert_eq!(seq2, seq1 + 1);
}

#[tokio::test]
async fn sessions_are_independent() {
    let bus = TetherBus::new(64);
    let a = bus
        .send("inst-a", TetherChannel::Host, "sess-a", "message".into(), None, json!({}))
        .await;
    let b = bus
        .send("inst-a", TetherChannel::Host, "sess-b", "message".into(), None, json!({}))
        .await;
    assert_eq!(a, b, "first frame in each independent session starts at the same seq");
}

#[tokio::test]
async fn poll_returns_immediately_when_frames_already_pending() {
    let bus = TetherBus::new(64);
    bus.send("inst-a", TetherChannel::Host, "sess-1", "message".into(), None, json!({"n": 1}))
        .await;

    let result = bus.poll("inst-a", TetherChannel::Host, "sess-1", 0, 10, 5_000).await;
    assert_eq!(result.frames.len(), 1);
    assert!(!result.timed_out);
}

#[tokio::test]
async fn poll_times_out_when_nothing_arrives() {
    let bus = TetherBus::new(64);
    let start = std::time::Instant::now();
    let result = bus.poll("inst-a", TetherChannel::Host, "sess-1", 0, 10, 200).await;
    assert!(result.timed_out);
    assert!(result.frames.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn poll_wakes_up_when_a_frame_arrives_mid_wait() {
    let bus = std::sync::Arc::new(TetherBus::new(64));
    let poller = bus.clone();
    let waiter = tokio::spawn(async move {
        poller.poll("inst-a", TetherChannel::Host, "sess-1", 0, 10, 5_000).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.send("inst-a", TetherChannel::Host, "sess-1", "message".into(), None, json!({"n": 1}))
        .await;

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("poll task did not finish")
        .unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.frames.len(), 1);
}

#[tokio::test]
async fn after_seq_excludes_already_seen_frames() {
    let bus = TetherBus::new(64);
    let first = bus
        .send("inst-a", TetherChannel::Host, "sess-1", "message".into(), None, json!({"n": 1}))
        .await;
    bus.send("inst-a", TetherChannel::Host, "sess-1", "message".into(), None, json!({"n": 2}))
        .await;

    let result = bus.poll("inst-a", TetherChannel::Host, "sess-1", first, 10, 0).await;
    assert_eq!(result.frames.len(), 1);
}
