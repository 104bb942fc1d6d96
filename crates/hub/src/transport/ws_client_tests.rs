// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn config_defaults_match_contract() {
    let config = WsClientConfig::new("ws://localhost:9000/ws");
    assert!(config.auto_reconnect);
    assert_eq!(config.max_reconnect_attempts, 5);
    assert_eq!(config.reconnect_delay, Duration::from_millis(1000));
    assert_eq!(config.ping_interval, Duration::from_secs(30));
}

#[yare::parameterized(
    first = { 1 },
    second = { 2 },
    third = { 3 },
    fourth = { 4 },
    fifth = { 5 },
)]
fn backoff_stays_within_jitter_bounds(attempt: u32) {
    let base = Duration::from_millis(1000);
    let exp = 1000u64 * (1 << (attempt - 1));
    let lower = ((exp as f64) * 0.7).max(100.0) as u128;
    let upper = ((exp as f64) * 1.3).ceil() as u128;

    for _ in 0..100 {
        let delay = reconnect_delay(base, attempt).as_millis();
        assert!(
            delay >= lower && delay <= upper,
            "attempt {attempt}: {delay}ms outside [{lower}, {upper}]"
        );
    }
}

#[test]
fn backoff_is_floored_at_100ms() {
    // A tiny base cannot jitter below the floor.
    for attempt in 1..=3 {
        let delay = reconnect_delay(Duration::from_millis(10), attempt);
        assert!(delay >= Duration::from_millis(100), "attempt {attempt}: {delay:?}");
    }
}

#[tokio::test]
async fn send_before_initialize_is_not_connected() {
    let transport = WsClientTransport::new(WsClientConfig::new("ws://127.0.0.1:1/ws"));
    let err = transport
        .send(HubMessage::event("a.b", "s1", None))
        .await
        .expect_err("not initialized");
    assert_eq!(err.code, crate::error::ErrorCode::NotConnected);
    assert_eq!(err.message, "transport ws-client is not connected");
}

#[tokio::test]
async fn initialize_fails_fast_without_reconnect() {
    let mut config = WsClientConfig::new("ws://127.0.0.1:1/ws");
    config.auto_reconnect = false;
    let transport = WsClientTransport::new(config);

    let err = transport.initialize().await.expect_err("unreachable");
    assert_eq!(err.code, crate::error::ErrorCode::TransportError);
    assert_eq!(transport.state(), TransportState::Disconnected);
}

#[tokio::test]
async fn initialize_exhausts_reconnect_attempts() {
    let mut config = WsClientConfig::new("ws://127.0.0.1:1/ws");
    config.max_reconnect_attempts = 2;
    config.reconnect_delay = Duration::from_millis(1);
    let transport = WsClientTransport::new(config);

    let err = transport.initialize().await.expect_err("unreachable");
    assert!(err.message.contains("after 2 attempts"));
    assert_eq!(transport.state(), TransportState::Error);
}
