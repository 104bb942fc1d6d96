// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-domain-socket transport, NDJSON framed.
//!
//! `server` mode unlinks any stale socket file, listens, and serves many
//! concurrent clients; each accepted connection gets a UUID client id that
//! is stamped onto every inbound message and (optionally) registered with
//! a [`Router`]. `client` mode connects to an existing socket. The socket
//! file is removed again on graceful close.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::HubError;
use crate::protocol::HubMessage;
use crate::router::{ClientConnection, Router};
use crate::transport::{
    decode_line, encode_line, BoxFuture, CallbackId, ConnectionCallback, DisconnectCallback,
    MessageCallback, Transport, TransportShared, TransportState,
};

/// Well-known socket path for a named daemon:
/// `${TMPDIR:-/tmp}/liuboer-<daemon>.sock`.
pub fn daemon_socket_path(daemon: &str) -> PathBuf {
    let tmp = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    tmp.join(format!("liuboer-{daemon}.sock"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixSocketMode {
    Server,
    Client,
}

/// Delivery handle for one accepted connection. Sends are enqueued; a
/// per-connection writer task appends the NDJSON newline and flushes.
struct UnixClientConnection {
    id: String,
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
}

impl ClientConnection for UnixClientConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, text: &str) -> Result<(), HubError> {
        self.tx
            .send(text.to_owned())
            .map_err(|_| HubError::transport("unix connection writer gone"))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

pub struct UnixSocketTransport {
    shared: Arc<TransportShared>,
    mode: UnixSocketMode,
    path: PathBuf,
    router: Option<Arc<Router>>,
    started: AtomicBool,
    cancel: CancellationToken,
    /// Client-mode write half.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Server-mode connections by client id.
    conns: Arc<Mutex<HashMap<String, Arc<UnixClientConnection>>>>,
    disconnect_callbacks: Arc<Mutex<Vec<DisconnectCallback>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnixSocketTransport {
    /// Listening side. Connections are registered with `router` when one is
    /// supplied.
    pub fn server(path: impl Into<PathBuf>, router: Option<Arc<Router>>) -> Arc<Self> {
        Self::new(UnixSocketMode::Server, path.into(), router)
    }

    /// Connecting side.
    pub fn client(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::new(UnixSocketMode::Client, path.into(), None)
    }

    fn new(mode: UnixSocketMode, path: PathBuf, router: Option<Arc<Router>>) -> Arc<Self> {
        let name = match mode {
            UnixSocketMode::Server => "unix-server",
            UnixSocketMode::Client => "unix-client",
        };
        Arc::new(Self {
            shared: Arc::new(TransportShared::new(name)),
            mode,
            path,
            router,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            writer: tokio::sync::Mutex::new(None),
            conns: Arc::new(Mutex::new(HashMap::new())),
            disconnect_callbacks: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn mode(&self) -> UnixSocketMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Observe client disconnects (server mode).
    pub fn on_client_disconnect(&self, handler: DisconnectCallback) {
        self.disconnect_callbacks.lock().push(handler);
    }

    /// Connected clients (server mode).
    pub fn connection_count(&self) -> usize {
        self.conns.lock().len()
    }

    async fn initialize_server(&self) -> Result<(), HubError> {
        // Unlink any stale socket left by a previous run.
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)
            .map_err(|err| HubError::transport(format!("unix bind failed: {err}")))?;
        tracing::info!(path = %self.path.display(), "unix socket listening");

        let shared = Arc::clone(&self.shared);
        let conns = Arc::clone(&self.conns);
        let router = self.router.clone();
        let disconnects = Arc::clone(&self.disconnect_callbacks);
        let cancel = self.cancel.clone();
        let accept = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let stream = match accepted {
                            Ok((stream, _)) => stream,
                            Err(err) => {
                                tracing::warn!(%err, "unix accept failed");
                                continue;
                            }
                        };
                        tokio::spawn(serve_connection(
                            stream,
                            Arc::clone(&shared),
                            Arc::clone(&conns),
                            router.clone(),
                            Arc::clone(&disconnects),
                            cancel.child_token(),
                        ));
                    }
                }
            }
        });
        self.tasks.lock().push(accept);
        Ok(())
    }

    async fn initialize_client(&self) -> Result<(), HubError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|err| HubError::transport(format!("unix connect failed: {err}")))?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let reader = tokio::spawn(async move {
            read_lines(read_half, &shared, None, cancel).await;
            shared.set_state(TransportState::Disconnected, Some("server closed".to_owned()));
        });
        self.tasks.lock().push(reader);
        Ok(())
    }
}

/// Read NDJSON lines until EOF/cancel, stamping `client_id` when given.
async fn read_lines(
    read_half: OwnedReadHalf,
    shared: &TransportShared,
    client_id: Option<&str>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(mut msg) = decode_line(shared.name(), &line) {
                            if let Some(id) = client_id {
                                msg.client_id = Some(id.to_owned());
                            }
                            shared.emit(msg);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(%err, "unix read failed");
                        break;
                    }
                }
            }
        }
    }
}

/// Per-accepted-connection loop (server mode).
async fn serve_connection(
    stream: UnixStream,
    shared: Arc<TransportShared>,
    conns: Arc<Mutex<HashMap<String, Arc<UnixClientConnection>>>>,
    router: Option<Arc<Router>>,
    disconnects: Arc<Mutex<Vec<DisconnectCallback>>>,
    cancel: CancellationToken,
) {
    let client_id = Uuid::new_v4().to_string();
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let open = Arc::new(AtomicBool::new(true));

    let conn = Arc::new(UnixClientConnection {
        id: client_id.clone(),
        tx,
        open: Arc::clone(&open),
    });
    conns.lock().insert(client_id.clone(), Arc::clone(&conn));
    if let Some(ref router) = router {
        router.register_connection(conn);
    }
    tracing::debug!(client_id = %client_id, "unix client connected");

    let write_open = Arc::clone(&open);
    let write_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_cancel.cancelled() => break,
                text = rx.recv() => {
                    let Some(mut text) = text else { break };
                    text.push('\n');
                    if write_half.write_all(text.as_bytes()).await.is_err()
                        || write_half.flush().await.is_err()
                    {
                        write_open.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        }
    });

    read_lines(read_half, &shared, Some(client_id.as_str()), cancel).await;

    open.store(false, Ordering::Release);
    writer.abort();
    conns.lock().remove(&client_id);
    if let Some(ref router) = router {
        router.unregister_connection(&client_id);
    }
    let callbacks: Vec<DisconnectCallback> = disconnects.lock().iter().map(Arc::clone).collect();
    for cb in callbacks {
        cb(client_id.clone());
    }
    tracing::debug!(client_id = %client_id, "unix client disconnected");
}

impl Transport for UnixSocketTransport {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.started.load(Ordering::Acquire) {
                return Ok(());
            }
            self.shared.set_state(TransportState::Connecting, None);
            let result = match self.mode {
                UnixSocketMode::Server => self.initialize_server().await,
                UnixSocketMode::Client => self.initialize_client().await,
            };
            match result {
                Ok(()) => {
                    self.started.store(true, Ordering::Release);
                    self.shared.set_state(TransportState::Connected, None);
                    Ok(())
                }
                Err(err) => {
                    self.shared.set_state(TransportState::Error, Some(err.message.clone()));
                    Err(err)
                }
            }
        })
    }

    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if !self.started.load(Ordering::Acquire) {
                return Err(HubError::not_connected(self.name()));
            }
            if self.shared.state() != TransportState::Connected {
                return Err(HubError::transport("unix socket is not connected"));
            }
            match self.mode {
                UnixSocketMode::Client => {
                    let line = encode_line(&msg)?;
                    let mut guard = self.writer.lock().await;
                    let Some(writer) = guard.as_mut() else {
                        return Err(HubError::transport("unix writer closed"));
                    };
                    if let Err(err) = async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.flush().await
                    }
                    .await
                    {
                        return Err(HubError::transport(format!("unix write failed: {err}")));
                    }
                    Ok(())
                }
                UnixSocketMode::Server => {
                    // Route by the internal client id when present, else
                    // broadcast to every open connection.
                    let text = msg.to_wire()?;
                    if let Some(ref client_id) = msg.client_id {
                        let conn = self.conns.lock().get(client_id).cloned();
                        return match conn {
                            Some(conn) if conn.is_open() => conn.send(&text),
                            _ => Err(HubError::transport(format!(
                                "unknown or closed unix client: {client_id}"
                            ))),
                        };
                    }
                    let conns: Vec<Arc<UnixClientConnection>> =
                        self.conns.lock().values().cloned().collect();
                    for conn in conns {
                        if conn.is_open() {
                            let _ = conn.send(&text);
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.cancel.cancel();
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            let drained: Vec<Arc<UnixClientConnection>> =
                self.conns.lock().drain().map(|(_, conn)| conn).collect();
            for conn in drained {
                conn.open.store(false, Ordering::Release);
                if let Some(ref router) = self.router {
                    router.unregister_connection(&conn.id);
                }
            }
            self.writer.lock().await.take();
            if self.mode == UnixSocketMode::Server {
                let _ = std::fs::remove_file(&self.path);
            }
            self.shared.set_state(TransportState::Disconnected, None);
            Ok(())
        })
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    fn on_message(&self, callback: MessageCallback) -> CallbackId {
        self.shared.add_message_callback(callback)
    }

    fn off_message(&self, id: CallbackId) {
        self.shared.remove_message_callback(id);
    }

    fn on_connection_change(&self, callback: ConnectionCallback) -> CallbackId {
        self.shared.add_connection_callback(callback)
    }

    fn off_connection_change(&self, id: CallbackId) {
        self.shared.remove_connection_callback(id);
    }
}

#[cfg(test)]
#[path = "unix_tests.rs"]
mod tests;
