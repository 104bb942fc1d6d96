// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Full-stack smoke: boot the daemon, connect a WebSocket peer, exercise
//! the session method family and its lifecycle events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

use liuboer::hub::{
    event_handler, HubConfig, MessageHub, RequestOptions, SubscribeOptions,
};
use liuboer::test_support::wait_until;
use liuboer::transport::ws_client::{WsClientConfig, WsClientTransport};
use liuboer::transport::Transport;
use liuboerd::config::Config;
use liuboerd::run;

fn smoke_config(socket_name: &str) -> Config {
    Config::parse_from([
        "liuboerd",
        "--bind",
        "127.0.0.1:0",
        "--socket-name",
        socket_name,
        "--no-unix-socket",
    ])
}

async fn connect(addr: std::net::SocketAddr) -> anyhow::Result<Arc<MessageHub>> {
    let hub = MessageHub::new(HubConfig::default());
    let transport = WsClientTransport::new(WsClientConfig::new(format!("ws://{addr}/ws")));
    hub.register_transport(transport.clone()).map_err(|e| anyhow::anyhow!("{e}"))?;
    transport.initialize().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(hub)
}

#[tokio::test]
async fn session_lifecycle_over_the_daemon() -> anyhow::Result<()> {
    let config = smoke_config("smoke-a");
    let daemon = run::start(&config).await?;
    let addr = daemon.ws_addr().ok_or_else(|| anyhow::anyhow!("no ws addr"))?;

    let observer = connect(addr).await?;
    let creations = Arc::new(AtomicU32::new(0));
    let counter = creations.clone();
    observer
        .subscribe(
            "session.created",
            event_handler(move |_msg| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }),
            SubscribeOptions { ack: true, ..SubscribeOptions::default() },
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let caller = connect(addr).await?;
    let created = caller
        .request("session.create", json!({"title": "demo"}), RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let session_id = created["sessionId"].as_str().map(str::to_owned);
    let session_id = session_id.ok_or_else(|| anyhow::anyhow!("missing sessionId"))?;

    // The observer saw the global lifecycle event.
    assert!(wait_until(Duration::from_secs(2), || creations.load(Ordering::Relaxed) == 1).await);

    let listed = caller
        .request("session.list", Value::Null, RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(listed["sessions"].as_array().map(Vec::len), Some(1));

    let fetched = caller
        .request("session.get", json!({"sessionId": session_id}), RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(fetched["title"].as_str(), Some("demo"));

    caller
        .request("session.delete", json!({"sessionId": session_id}), RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(daemon.registry.count(), 0);

    daemon.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn room_membership_over_the_daemon() -> anyhow::Result<()> {
    let config = smoke_config("smoke-b");
    let daemon = run::start(&config).await?;
    let addr = daemon.ws_addr().ok_or_else(|| anyhow::anyhow!("no ws addr"))?;

    let peer = connect(addr).await?;
    peer.request("room.join", json!({"channel": "ops"}), RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let members = daemon.channels.channel_members("ops");
    assert_eq!(members.len(), 1);

    peer.request("room.leave", json!({"channel": "ops"}), RequestOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(daemon.channels.channel_members("ops").is_empty());

    daemon.shutdown().await;
    Ok(())
}
