// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for the end-to-end scenario suite.

use std::sync::Arc;

use liuboer::hub::{HubConfig, MessageHub};
use liuboer::transport::in_process::{create_pair, InProcessOptions, InProcessTransport};
use liuboer::transport::Transport;

/// Two hubs joined by an in-process transport pair.
pub struct HubPair {
    pub client_hub: Arc<MessageHub>,
    pub server_hub: Arc<MessageHub>,
    pub client_transport: Arc<InProcessTransport>,
    pub server_transport: Arc<InProcessTransport>,
}

/// Build and initialize a connected hub pair with default configs.
pub async fn hub_pair(options: InProcessOptions) -> anyhow::Result<HubPair> {
    hub_pair_with(options, HubConfig::default(), HubConfig::default()).await
}

/// Build and initialize a connected hub pair with explicit configs.
pub async fn hub_pair_with(
    options: InProcessOptions,
    client_config: HubConfig,
    server_config: HubConfig,
) -> anyhow::Result<HubPair> {
    let (client_transport, server_transport) = create_pair(options);

    let client_hub = MessageHub::new(client_config);
    client_hub
        .register_transport(client_transport.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    client_transport.initialize().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let server_hub = MessageHub::new(server_config);
    server_hub
        .register_transport(server_transport.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    server_transport.initialize().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(HubPair { client_hub, server_hub, client_transport, server_transport })
}
