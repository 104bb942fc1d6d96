// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket server transport: axum `/ws` upgrade, one JSON text frame per
//! message, one adapter per accepted connection.
//!
//! Each connection gets a UUID client id. Inbound frames are validated and
//! stamped with that id before reaching the hub; a connection closing is
//! unregistered from the [`Router`] and reported to disconnect observers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::HubError;
use crate::protocol::HubMessage;
use crate::router::{ClientConnection, Router};
use crate::transport::{
    BoxFuture, CallbackId, ConnectionCallback, DisconnectCallback, MessageCallback, Transport,
    TransportShared, TransportState,
};

/// Delivery handle for one accepted WebSocket. Sends enqueue a text frame;
/// the connection's write loop pushes it onto the socket.
struct WsServerConnection {
    id: String,
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

impl ClientConnection for WsServerConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, text: &str) -> Result<(), HubError> {
        self.tx
            .send(text.to_owned())
            .map_err(|_| HubError::transport("ws connection writer gone"))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct WsServerState {
    shared: Arc<TransportShared>,
    conns: Mutex<HashMap<String, Arc<WsServerConnection>>>,
    router: Option<Arc<Router>>,
    disconnect_callbacks: Mutex<Vec<DisconnectCallback>>,
    cancel: CancellationToken,
}

pub struct WsServerTransport {
    state: Arc<WsServerState>,
    bind: SocketAddr,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsServerTransport {
    /// Connections are registered with `router` when one is supplied.
    pub fn new(bind: SocketAddr, router: Option<Arc<Router>>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(WsServerState {
                shared: Arc::new(TransportShared::new("ws-server")),
                conns: Mutex::new(HashMap::new()),
                router,
                disconnect_callbacks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
            bind,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            serve_task: Mutex::new(None),
        })
    }

    /// The bound address; differs from the requested one for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.state.conns.lock().len()
    }

    /// Observe client disconnects.
    pub fn on_client_disconnect(&self, handler: DisconnectCallback) {
        self.state.disconnect_callbacks.lock().push(handler);
    }
}

/// `GET /ws` — WebSocket upgrade for one hub client.
async fn ws_handler(
    State(state): State<Arc<WsServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

/// Per-connection event loop.
async fn handle_connection(state: Arc<WsServerState>, socket: WebSocket) {
    let client_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let open = Arc::new(AtomicBool::new(true));

    let conn = Arc::new(WsServerConnection {
        id: client_id.clone(),
        tx,
        open: Arc::clone(&open),
    });
    state.conns.lock().insert(client_id.clone(), Arc::clone(&conn));
    if let Some(ref router) = state.router {
        router.register_connection(conn);
    }
    tracing::debug!(client_id = %client_id, "ws client connected");

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,

            text = rx.recv() => {
                let Some(text) = text else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match HubMessage::from_wire(&text) {
                            Ok(mut msg) => {
                                msg.client_id = Some(client_id.clone());
                                state.shared.emit(msg);
                            }
                            Err(err) => {
                                tracing::warn!(
                                    client_id = %client_id,
                                    %err,
                                    "dropping invalid ws frame"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // ping/pong/binary ignored
                }
            }
        }
    }

    open.store(false, Ordering::Release);
    state.conns.lock().remove(&client_id);
    if let Some(ref router) = state.router {
        router.unregister_connection(&client_id);
    }
    let callbacks: Vec<DisconnectCallback> =
        state.disconnect_callbacks.lock().iter().map(Arc::clone).collect();
    for cb in callbacks {
        cb(client_id.clone());
    }
    tracing::debug!(client_id = %client_id, "ws client disconnected");
}

impl Transport for WsServerTransport {
    fn name(&self) -> &str {
        self.state.shared.name()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.started.load(Ordering::Acquire) {
                return Ok(());
            }
            self.state.shared.set_state(TransportState::Connecting, None);

            let listener = tokio::net::TcpListener::bind(self.bind)
                .await
                .map_err(|err| HubError::transport(format!("ws bind failed: {err}")))?;
            let local = listener
                .local_addr()
                .map_err(|err| HubError::transport(format!("ws local_addr failed: {err}")))?;
            *self.local_addr.lock() = Some(local);
            tracing::info!(addr = %local, "websocket server listening");

            let app = axum::Router::new()
                .route("/ws", get(ws_handler))
                .with_state(Arc::clone(&self.state));
            let cancel = self.state.cancel.clone();
            let task = tokio::spawn(async move {
                let shutdown = cancel.cancelled_owned();
                if let Err(err) =
                    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
                {
                    tracing::warn!(%err, "websocket server stopped");
                }
            });
            *self.serve_task.lock() = Some(task);
            self.started.store(true, Ordering::Release);
            self.state.shared.set_state(TransportState::Connected, None);
            Ok(())
        })
    }

    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if !self.started.load(Ordering::Acquire) {
                return Err(HubError::not_connected(self.name()));
            }
            let text = msg.to_wire()?;

            // Route by the internal client id when present, else broadcast.
            if let Some(ref client_id) = msg.client_id {
                let conn = self.state.conns.lock().get(client_id).cloned();
                return match conn {
                    Some(conn) if conn.is_open() => conn.send(&text),
                    _ => Err(HubError::transport(format!(
                        "unknown or closed ws client: {client_id}"
                    ))),
                };
            }
            let conns: Vec<Arc<WsServerConnection>> =
                self.state.conns.lock().values().cloned().collect();
            for conn in conns {
                if conn.is_open() {
                    let _ = conn.send(&text);
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.state.cancel.cancel();
            if let Some(task) = self.serve_task.lock().take() {
                task.abort();
            }
            let drained: Vec<Arc<WsServerConnection>> =
                self.state.conns.lock().drain().map(|(_, conn)| conn).collect();
            for conn in drained {
                conn.open.store(false, Ordering::Release);
                if let Some(ref router) = self.state.router {
                    router.unregister_connection(&conn.id);
                }
            }
            self.state.shared.set_state(TransportState::Disconnected, None);
            Ok(())
        })
    }

    fn state(&self) -> TransportState {
        self.state.shared.state()
    }

    fn on_message(&self, callback: MessageCallback) -> CallbackId {
        self.state.shared.add_message_callback(callback)
    }

    fn off_message(&self, id: CallbackId) {
        self.state.shared.remove_message_callback(id);
    }

    fn on_connection_change(&self, callback: ConnectionCallback) -> CallbackId {
        self.state.shared.add_connection_callback(callback)
    }

    fn off_connection_change(&self, id: CallbackId) {
        self.state.shared.remove_connection_callback(id);
    }
}
