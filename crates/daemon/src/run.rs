// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon wiring: one hub, one router, one channel manager, a WebSocket
//! listener for UI peers, and a unix socket for local CLI peers.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use liuboer::channel::ChannelManager;
use liuboer::hub::{HubConfig, MessageHub};
use liuboer::router::{Router, RouterConfig};
use liuboer::transport::unix::{daemon_socket_path, UnixSocketTransport};
use liuboer::transport::ws_server::WsServerTransport;
use liuboer::transport::Transport;

use crate::config::Config;
use crate::sessions::{self, SessionRegistry};

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
/// Priority: `--log-level` / `LIUBOER_LOG_LEVEL` > `RUST_LOG` > "info".
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("LIUBOER_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// A running daemon, shut down via [`Daemon::shutdown`].
pub struct Daemon {
    pub hub: Arc<MessageHub>,
    pub router: Arc<Router>,
    pub channels: Arc<ChannelManager>,
    pub registry: Arc<SessionRegistry>,
    ws: Arc<WsServerTransport>,
    unix: Option<Arc<UnixSocketTransport>>,
}

impl Daemon {
    /// The bound WebSocket address.
    pub fn ws_addr(&self) -> Option<std::net::SocketAddr> {
        self.ws.local_addr()
    }

    pub async fn shutdown(&self) {
        if let Some(ref unix) = self.unix {
            if let Err(err) = unix.close().await {
                tracing::debug!(%err, "unix close failed");
            }
        }
        if let Err(err) = self.ws.close().await {
            tracing::debug!(%err, "ws close failed");
        }
        self.hub.cleanup();
    }
}

/// Bring up every listener and register the session handlers.
pub async fn start(config: &Config) -> anyhow::Result<Daemon> {
    let router = Arc::new(Router::new(RouterConfig { debug: config.debug }));
    let channels = Arc::new(ChannelManager::new());
    let hub = MessageHub::new(HubConfig::default());
    hub.attach_router(Arc::clone(&router), Arc::clone(&channels));

    // WebSocket listener is the hub's registered transport.
    let ws = WsServerTransport::new(config.bind_addr()?, Some(Arc::clone(&router)));
    attach_disconnect_hooks(&hub, &channels, |cb| ws.on_client_disconnect(cb));
    hub.register_transport(ws.clone()).map_err(|e| anyhow::anyhow!("{e}"))?;
    ws.initialize().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    // The unix socket feeds the same hub through `inject`; replies and
    // fan-out reach its clients through the shared router.
    let unix = if config.no_unix_socket {
        None
    } else {
        let path = daemon_socket_path(&config.socket_name);
        let unix = UnixSocketTransport::server(&path, Some(Arc::clone(&router)));
        attach_disconnect_hooks(&hub, &channels, |cb| unix.on_client_disconnect(cb));
        let hub_inject = Arc::clone(&hub);
        unix.on_message(Arc::new(move |msg| hub_inject.inject(msg)));
        unix.initialize().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        Some(unix)
    };

    let registry = Arc::new(SessionRegistry::new());
    sessions::register_handlers(&hub, Arc::clone(&registry))
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    info!(
        bind = %config.bind,
        socket = %config.socket_name,
        unix = unix.is_some(),
        "liuboerd ready"
    );
    Ok(Daemon { hub, router, channels, registry, ws, unix })
}

/// On any client disconnect: clear channel membership and sequence state.
/// The router unregistration already happens inside the server transports.
fn attach_disconnect_hooks(
    hub: &Arc<MessageHub>,
    channels: &Arc<ChannelManager>,
    register: impl FnOnce(liuboer::transport::DisconnectCallback),
) {
    let hub = Arc::downgrade(hub);
    let channels = Arc::clone(channels);
    register(Arc::new(move |client_id: String| {
        channels.remove_client(&client_id);
        if let Some(hub) = hub.upgrade() {
            hub.cleanup_client_sequence(&client_id);
        }
    }));
}

/// Run until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    config.validate()?;
    let daemon = start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    daemon.shutdown().await;
    Ok(())
}
