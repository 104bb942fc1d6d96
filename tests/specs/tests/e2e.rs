// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end behavior of the messaging fabric: RPC, liveness, fan-out,
//! isolation, cancellation, and the documented boundary behaviors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use liuboer::channel::ChannelManager;
use liuboer::error::ErrorCode;
use liuboer::hub::{
    event_handler, request_handler, EventOptions, HubConfig, MessageHub, RequestOptions,
    SubscribeOptions,
};
use liuboer::protocol::{HubMessage, MessageType, GLOBAL_SESSION};
use liuboer::router::{ClientConnection, Router, RouterConfig};
use liuboer::test_support::{wait_until, MockConnection};
use liuboer::transport::in_process::InProcessOptions;
use liuboer::transport::Transport;

use liuboer_specs::hub_pair;

// ── scenario: RPC happy path over the in-process pair ─────────────────

#[tokio::test]
async fn rpc_happy_path() -> anyhow::Result<()> {
    let pair = hub_pair(InProcessOptions::default()).await?;
    pair.server_hub
        .on_request(
            "math.add",
            request_handler(|ctx| async move {
                let a = ctx.data["a"].as_i64().unwrap_or(0);
                let b = ctx.data["b"].as_i64().unwrap_or(0);
                Ok(json!({"result": a + b}))
            }),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let value = pair
        .client_hub
        .request("math.add", json!({"a": 5, "b": 3}), RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(value, json!({"result": 8}));
    Ok(())
}

// ── scenario: PING triggers exactly one PONG ──────────────────────────

#[tokio::test]
async fn ping_triggers_pong() -> anyhow::Result<()> {
    let pair = hub_pair(InProcessOptions::default()).await?;

    let pongs: Arc<parking_lot::Mutex<Vec<HubMessage>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&pongs);
    pair.client_transport.on_message(Arc::new(move |msg| {
        if msg.msg_type == MessageType::Pong {
            sink.lock().push(msg);
        }
    }));

    let ping = HubMessage::ping(GLOBAL_SESSION).with_id("p1");
    pair.client_transport.send(ping).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    assert!(wait_until(Duration::from_secs(1), || !pongs.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pongs = pongs.lock();
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0].request_id.as_deref(), Some("p1"));
    Ok(())
}

// ── scenario: fan-out with mixed readiness ────────────────────────────

#[tokio::test]
async fn fan_out_with_mixed_readiness() -> anyhow::Result<()> {
    let router = Router::new(RouterConfig::default());
    let first = MockConnection::new("first");
    let second = MockConnection::new("second");
    let third = MockConnection::new("third");
    for conn in [&first, &second, &third] {
        router.register_connection(conn.clone());
        router
            .subscribe("s1", "user.created", conn.id())
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    second.set_open(false);

    let event = HubMessage::event("user.created", "s1", Some(json!({"userId": "u1"})));
    let report = router.route_event(&event);

    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.total_subscribers, 3);
    assert_eq!(first.sent_count(), 1);
    assert_eq!(second.sent_count(), 0);
    assert_eq!(third.sent_count(), 1);
    Ok(())
}

// ── scenario: cross-session isolation ─────────────────────────────────

#[tokio::test]
async fn cross_session_isolation() -> anyhow::Result<()> {
    let router = Router::new(RouterConfig::default());
    let conn = MockConnection::new("c1");
    router.register_connection(conn.clone());
    router.subscribe("s1", "user.created", "c1").map_err(|e| anyhow::anyhow!("{e}"))?;

    let report =
        router.route_event(&HubMessage::event("user.created", "s2", Some(json!({}))));
    assert_eq!(report.total_subscribers, 0);
    assert_eq!(conn.sent_count(), 0);
    Ok(())
}

// ── scenario: disconnect during a pending request ─────────────────────

#[tokio::test]
async fn disconnect_during_pending_request() -> anyhow::Result<()> {
    let pair = hub_pair(InProcessOptions::default()).await?;
    pair.server_hub
        .on_request(
            "test.method",
            request_handler(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let hub = pair.client_hub.clone();
    let pending = tokio::spawn(async move {
        hub.request(
            "test.method",
            json!({}),
            RequestOptions { timeout: Some(Duration::from_secs(5)), ..RequestOptions::default() },
        )
        .await
    });
    assert!(wait_until(Duration::from_secs(1), || pair.client_hub.pending_call_count() == 1).await);

    pair.server_transport.close().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let err = tokio::time::timeout(Duration::from_millis(500), pending)
        .await
        .map_err(|_| anyhow::anyhow!("rejection took too long"))?
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .expect_err("must reject");
    assert_eq!(err.code, ErrorCode::TransportError);
    assert_eq!(pair.client_hub.pending_call_count(), 0);
    Ok(())
}

// ── scenario: invalid method at the API surface ───────────────────────

#[tokio::test]
async fn invalid_method_rejected_at_surface() -> anyhow::Result<()> {
    let pair = hub_pair(InProcessOptions::default()).await?;

    let err = pair
        .client_hub
        .request("", json!({}), RequestOptions::default())
        .await
        .expect_err("empty method");
    assert_eq!(err.code, ErrorCode::InvalidMethod);

    let err = pair
        .client_hub
        .event("bad:method", json!({}), EventOptions::default())
        .await
        .expect_err("colon method");
    assert_eq!(err.code, ErrorCode::InvalidMethod);
    Ok(())
}

// ── boundary: backpressure at max_pending_calls = 2 ───────────────────

#[tokio::test]
async fn backpressure_at_two_pending_calls() -> anyhow::Result<()> {
    let pair = liuboer_specs::hub_pair_with(
        InProcessOptions::default(),
        HubConfig { max_pending_calls: 2, ..HubConfig::default() },
        HubConfig::default(),
    )
    .await?;
    // Park calls on a handler that never answers within the test window.
    pair.server_hub
        .on_request(
            "park.forever",
            request_handler(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    for _ in 0..2 {
        let hub = pair.client_hub.clone();
        tokio::spawn(async move {
            let _ = hub.request("park.forever", json!({}), RequestOptions::default()).await;
        });
    }
    assert!(wait_until(Duration::from_secs(1), || pair.client_hub.pending_call_count() == 2).await);

    let err = pair
        .client_hub
        .request("park.forever", json!({}), RequestOptions::default())
        .await
        .expect_err("third call rejected");
    assert_eq!(err.code, ErrorCode::TransportError);
    assert!(err.message.contains("Too many pending calls"));
    Ok(())
}

// ── boundary: event recursion capped at depth 16 ──────────────────────

#[tokio::test]
async fn event_recursion_capped_at_sixteen() -> anyhow::Result<()> {
    let hub = MessageHub::new(HubConfig::default());
    let invocations = Arc::new(AtomicU32::new(0));

    let counter = invocations.clone();
    let hub_inner = hub.clone();
    hub.subscribe(
        "cycle.step",
        event_handler(move |msg: HubMessage| {
            let counter = counter.clone();
            let hub = hub_inner.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                let again =
                    HubMessage::event("cycle.step", &msg.session_id, None).with_id(msg.id);
                hub.emit(again).await
            }
        }),
        SubscribeOptions { session_id: Some("s1".to_owned()), ack: false },
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    hub.emit(HubMessage::event("cycle.step", "s1", None).with_id("diamond"))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(invocations.load(Ordering::Relaxed), 16);
    Ok(())
}

// ── invariant: outbound sequence is strictly increasing ───────────────

#[tokio::test]
async fn outbound_sequence_strictly_increases() -> anyhow::Result<()> {
    let pair = hub_pair(InProcessOptions::default()).await?;

    let seen: Arc<parking_lot::Mutex<Vec<u64>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    pair.server_transport.on_message(Arc::new(move |msg| {
        if msg.session_id == "s1" {
            if let Some(seq) = msg.sequence {
                sink.lock().push(seq);
            }
        }
    }));

    for _ in 0..5 {
        pair.client_hub
            .event("tick.tock", Value::Null, EventOptions { session_id: Some("s1".to_owned()) })
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    assert!(wait_until(Duration::from_secs(1), || seen.lock().len() == 5).await);
    let sequences = seen.lock().clone();
    for window in sequences.windows(2) {
        assert!(window[0] < window[1], "sequence not increasing: {sequences:?}");
    }
    Ok(())
}

// ── laws: router idempotence and cleanup ──────────────────────────────

#[tokio::test]
async fn router_registration_and_cleanup_laws() -> anyhow::Result<()> {
    let router = Router::new(RouterConfig::default());
    let conn = MockConnection::new("c1");

    // registerConnection is idempotent.
    for _ in 0..3 {
        assert_eq!(router.register_connection(conn.clone()), "c1");
    }
    assert_eq!(router.client_count(), 1);

    // subscribe then unsubscribe restores the index.
    router.subscribe("s1", "user.created", "c1").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(router.subscription_count("s1", "user.created"), 1);
    router.unsubscribe_client("s1", "user.created", "c1");
    assert_eq!(router.subscription_count("s1", "user.created"), 0);

    // unregister leaves nothing behind, channels included.
    let channels = ChannelManager::new();
    channels.join_channel("c1", "ops");
    router.subscribe("s1", "user.created", "c1").map_err(|e| anyhow::anyhow!("{e}"))?;
    router.unregister_connection("c1");
    channels.remove_client("c1");
    assert!(router.get_client_by_id("c1").is_none());
    assert_eq!(router.subscription_count("s1", "user.created"), 0);
    assert!(!channels.is_in_channel("c1", "ops"));
    Ok(())
}

// ── scenario: subscription ack and event delivery between hubs ────────

#[tokio::test]
async fn subscribe_ack_between_hub_peers() -> anyhow::Result<()> {
    let pair = hub_pair(InProcessOptions::default()).await?;

    // The server side owns the router; its pair transport stamps client ids.
    let router = Arc::new(Router::new(RouterConfig::default()));
    let channels = Arc::new(ChannelManager::new());
    pair.server_hub.attach_router(router.clone(), channels);

    let received = Arc::new(AtomicU32::new(0));
    let counter = received.clone();
    let handle = pair
        .client_hub
        .subscribe(
            "user.created",
            event_handler(move |_msg| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }),
            SubscribeOptions { session_id: Some("s1".to_owned()), ack: true },
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // The handshake landed in the server-side router index.
    assert_eq!(router.subscription_count("s1", "user.created"), 1);

    pair.client_hub.unsubscribe(&handle).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(
        wait_until(Duration::from_secs(1), || {
            router.subscription_count("s1", "user.created") == 0
        })
        .await
    );
    Ok(())
}
