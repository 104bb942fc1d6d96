// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::*;
use crate::test_support::wait_until;

async fn ready_pair(
    options: InProcessOptions,
) -> (Arc<InProcessTransport>, Arc<InProcessTransport>) {
    let (client, server) = create_pair(options);
    client.initialize().await.expect("client init");
    server.initialize().await.expect("server init");
    (client, server)
}

fn collect_inbound(transport: &InProcessTransport) -> Arc<Mutex<Vec<HubMessage>>> {
    let inbox: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    transport.on_message(Arc::new(move |msg| {
        sink.lock().push(msg);
    }));
    inbox
}

// ── pair ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn pair_delivers_both_directions() {
    let (client, server) = ready_pair(InProcessOptions::default()).await;
    let server_inbox = collect_inbound(&server);
    let client_inbox = collect_inbound(&client);

    client.send(HubMessage::call("math.add", "s1", None)).await.expect("send");
    server.send(HubMessage::event("user.created", "s1", None)).await.expect("send");

    assert!(wait_until(Duration::from_secs(1), || server_inbox.lock().len() == 1).await);
    assert!(wait_until(Duration::from_secs(1), || client_inbox.lock().len() == 1).await);
    assert_eq!(server_inbox.lock()[0].method, "math.add");
    assert_eq!(client_inbox.lock()[0].method, "user.created");
}

#[tokio::test]
async fn server_side_stamps_client_id() {
    let (client, server) = ready_pair(InProcessOptions::default()).await;
    let server_inbox = collect_inbound(&server);
    let client_inbox = collect_inbound(&client);

    client.send(HubMessage::call("a.b", "s1", None)).await.expect("send");
    server.send(HubMessage::event("c.d", "s1", None)).await.expect("send");

    assert!(wait_until(Duration::from_secs(1), || server_inbox.lock().len() == 1).await);
    assert!(wait_until(Duration::from_secs(1), || client_inbox.lock().len() == 1).await);

    // The server sees who sent the message; the client side does not stamp.
    assert_eq!(
        server_inbox.lock()[0].client_id.as_deref(),
        Some(client.client_id())
    );
    assert!(client_inbox.lock()[0].client_id.is_none());
}

#[tokio::test]
async fn pair_ids_are_distinct_uuids() {
    let (client, server) = create_pair(InProcessOptions::default());
    assert_ne!(client.client_id(), server.client_id());
    assert_eq!(client.peer_client_id(), server.client_id());
    assert_eq!(server.peer_client_id(), client.client_id());
}

#[tokio::test]
async fn send_before_initialize_is_not_connected() {
    let (client, _server) = create_pair(InProcessOptions::default());
    let err = client.send(HubMessage::event("a.b", "s1", None)).await.expect_err("early");
    assert_eq!(err.code, crate::error::ErrorCode::NotConnected);
}

#[tokio::test]
async fn close_notifies_the_server_side() {
    let (client, server) = ready_pair(InProcessOptions::default()).await;

    let disconnected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&disconnected);
    server.on_client_disconnect(Arc::new(move |peer| {
        sink.lock().push(peer);
    }));

    client.close().await.expect("close");

    assert!(wait_until(Duration::from_secs(1), || !disconnected.lock().is_empty()).await);
    assert_eq!(disconnected.lock()[0], client.client_id());
    assert!(
        wait_until(Duration::from_secs(1), || {
            server.state() == TransportState::Disconnected
        })
        .await
    );
}

#[tokio::test]
async fn send_after_peer_close_fails() {
    let (client, server) = ready_pair(InProcessOptions::default()).await;
    client.close().await.expect("close");
    assert!(
        wait_until(Duration::from_secs(1), || {
            server.state() == TransportState::Disconnected
        })
        .await
    );
    let err = server.send(HubMessage::event("a.b", "s1", None)).await.expect_err("peer gone");
    assert_eq!(err.code, crate::error::ErrorCode::TransportError);
}

#[tokio::test]
async fn simulated_latency_delays_delivery() {
    let options = InProcessOptions {
        simulated_latency: Some(Duration::from_millis(50)),
        ..InProcessOptions::default()
    };
    let (client, server) = ready_pair(options).await;
    let server_inbox = collect_inbound(&server);

    let start = Instant::now();
    client.send(HubMessage::event("a.b", "s1", None)).await.expect("send");
    assert!(wait_until(Duration::from_secs(1), || server_inbox.lock().len() == 1).await);
    assert!(start.elapsed() >= Duration::from_millis(45));
}

#[tokio::test]
async fn clone_messages_detaches_payloads() {
    let options = InProcessOptions { clone_messages: true, ..InProcessOptions::default() };
    let (client, server) = ready_pair(options).await;
    let server_inbox = collect_inbound(&server);

    let msg = HubMessage::event("a.b", "s1", Some(serde_json::json!({"nested": {"n": 1}})));
    let original_id = msg.id.clone();
    client.send(msg).await.expect("send");

    assert!(wait_until(Duration::from_secs(1), || server_inbox.lock().len() == 1).await);
    let received = server_inbox.lock()[0].clone();
    assert_eq!(received.id, original_id);
    assert_eq!(received.data, Some(serde_json::json!({"nested": {"n": 1}})));
    // Still stamped even through the clone path.
    assert_eq!(received.client_id.as_deref(), Some(client.client_id()));
}

// ── bus ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn bus_fans_out_excluding_the_sender() {
    let bus = InProcessBus::new();
    let a = bus.attach("a").expect("attach a");
    let b = bus.attach("b").expect("attach b");
    let c = bus.attach("c").expect("attach c");
    for member in [&a, &b, &c] {
        member.initialize().await.expect("init");
    }

    let a_inbox: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&a_inbox);
    a.on_message(Arc::new(move |msg| sink.lock().push(msg)));
    let b_inbox: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&b_inbox);
    b.on_message(Arc::new(move |msg| sink.lock().push(msg)));
    let c_inbox: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&c_inbox);
    c.on_message(Arc::new(move |msg| sink.lock().push(msg)));

    a.send(HubMessage::event("x.y", "s1", None)).await.expect("send");

    assert!(a_inbox.lock().is_empty());
    assert_eq!(b_inbox.lock().len(), 1);
    assert_eq!(c_inbox.lock().len(), 1);
}

#[tokio::test]
async fn bus_rejects_duplicate_names() {
    let bus = InProcessBus::new();
    let _a = bus.attach("dup").expect("attach");
    let err = bus.attach("dup").expect_err("duplicate");
    assert_eq!(err.code, crate::error::ErrorCode::TransportError);
    assert!(err.message.contains("dup"));
}

#[tokio::test]
async fn closing_a_member_detaches_it() {
    let bus = InProcessBus::new();
    let a = bus.attach("a").expect("attach");
    a.initialize().await.expect("init");
    assert_eq!(bus.member_count(), 1);
    a.close().await.expect("close");
    assert_eq!(bus.member_count(), 0);
    // The name is free again.
    let _a2 = bus.attach("a").expect("reattach");
}
