// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::router::RouterConfig;
use crate::test_support::wait_until;

fn socket_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("{name}.sock"))
}

fn collect_inbound(transport: &UnixSocketTransport) -> Arc<Mutex<Vec<HubMessage>>> {
    let inbox: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    transport.on_message(Arc::new(move |msg| sink.lock().push(msg)));
    inbox
}

// ── socket path helper ────────────────────────────────────────────────

#[test]
fn daemon_socket_path_uses_tmpdir_or_tmp() {
    let path = daemon_socket_path("agentd");
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert_eq!(name, "liuboer-agentd.sock");
    assert!(path.is_absolute() || std::env::var_os("TMPDIR").is_some());
}

// ── client/server round trip ──────────────────────────────────────────

#[tokio::test]
async fn client_to_server_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir, "rt");

    let server = UnixSocketTransport::server(&path, None);
    server.initialize().await.expect("server init");
    let server_inbox = collect_inbound(&server);

    let client = UnixSocketTransport::client(&path);
    client.initialize().await.expect("client init");
    let client_inbox = collect_inbound(&client);

    client
        .send(HubMessage::call("math.add", "s1", Some(serde_json::json!({"a": 2}))))
        .await
        .expect("client send");

    assert!(wait_until(Duration::from_secs(2), || server_inbox.lock().len() == 1).await);
    let inbound = server_inbox.lock()[0].clone();
    assert_eq!(inbound.method, "math.add");
    // The server stamped the accepted connection's id.
    let client_id = inbound.client_id.clone().expect("stamped client id");

    // Targeted reply travels back over the same connection.
    let mut reply = HubMessage::result("math.add", "s1", &inbound.id, None);
    reply.client_id = Some(client_id);
    server.send(reply).await.expect("server send");

    assert!(wait_until(Duration::from_secs(2), || client_inbox.lock().len() == 1).await);
    assert_eq!(client_inbox.lock()[0].msg_type, crate::protocol::MessageType::Result);
    // clientId never crossed the wire.
    assert!(client_inbox.lock()[0].client_id.is_none());

    client.close().await.expect("client close");
    server.close().await.expect("server close");
}

#[tokio::test]
async fn server_broadcasts_without_client_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir, "bc");

    let server = UnixSocketTransport::server(&path, None);
    server.initialize().await.expect("server init");

    let client_a = UnixSocketTransport::client(&path);
    client_a.initialize().await.expect("a init");
    let inbox_a = collect_inbound(&client_a);
    let client_b = UnixSocketTransport::client(&path);
    client_b.initialize().await.expect("b init");
    let inbox_b = collect_inbound(&client_b);

    assert!(wait_until(Duration::from_secs(2), || server.connection_count() == 2).await);

    server
        .send(HubMessage::event("system.notice", "global", None))
        .await
        .expect("broadcast");

    assert!(wait_until(Duration::from_secs(2), || inbox_a.lock().len() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || inbox_b.lock().len() == 1).await);
}

#[tokio::test]
async fn stale_socket_file_is_unlinked_on_bind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir, "stale");
    std::fs::write(&path, b"stale").expect("write stale file");

    let server = UnixSocketTransport::server(&path, None);
    server.initialize().await.expect("bind over stale socket");
    assert_eq!(server.state(), TransportState::Connected);
    server.close().await.expect("close");
    // Graceful close removed the socket file.
    assert!(!path.exists());
}

#[tokio::test]
async fn disconnect_unregisters_from_router_and_notifies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = socket_path(&dir, "reg");

    let router = Arc::new(Router::new(RouterConfig::default()));
    let server = UnixSocketTransport::server(&path, Some(router.clone()));
    server.initialize().await.expect("server init");

    let gone: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&gone);
    server.on_client_disconnect(Arc::new(move |id| sink.lock().push(id)));

    let client = UnixSocketTransport::client(&path);
    client.initialize().await.expect("client init");

    assert!(wait_until(Duration::from_secs(2), || router.client_count() == 1).await);
    let client_id = router.client_ids().remove(0);

    client.close().await.expect("client close");

    assert!(wait_until(Duration::from_secs(2), || router.client_count() == 0).await);
    assert!(wait_until(Duration::from_secs(2), || !gone.lock().is_empty()).await);
    assert_eq!(gone.lock()[0], client_id);
    server.close().await.expect("server close");
}

#[tokio::test]
async fn client_connect_to_missing_socket_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = UnixSocketTransport::client(socket_path(&dir, "missing"));
    let err = client.initialize().await.expect_err("no socket");
    assert_eq!(err.code, crate::error::ErrorCode::TransportError);
    assert_eq!(client.state(), TransportState::Error);
}

#[tokio::test]
async fn send_before_initialize_is_not_connected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = UnixSocketTransport::client(socket_path(&dir, "early"));
    let err = client.send(HubMessage::event("a.b", "s1", None)).await.expect_err("early");
    assert_eq!(err.code, crate::error::ErrorCode::NotConnected);
}
