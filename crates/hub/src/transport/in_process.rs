// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process transports: a peered pair for same-process client/server
//! wiring and tests, and a name-keyed bus for N-way fan-out.
//!
//! The pair shares no intermediate buffer: each side owns an unbounded
//! channel the other sends into. Delivery happens on a reader task, so
//! send order is preserved and simulated latency stays per-message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ErrorCode, HubError};
use crate::protocol::HubMessage;
use crate::transport::{
    BoxFuture, CallbackId, ConnectionCallback, DisconnectCallback, MessageCallback, Transport,
    TransportShared, TransportState,
};

#[derive(Debug, Clone, Default)]
pub struct InProcessOptions {
    /// Round-trip payloads through JSON on delivery, mimicking the deep
    /// copy a real wire provides. Off by default (zero-copy hand-off).
    pub clone_messages: bool,
    /// Delay each delivery, for test fidelity.
    pub simulated_latency: Option<Duration>,
}

pub struct InProcessTransport {
    shared: Arc<TransportShared>,
    options: InProcessOptions,
    client_id: String,
    peer_client_id: String,
    /// Stamp inbound messages with the peer's client id (server side).
    stamp_inbound: bool,
    started: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<HubMessage>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<HubMessage>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    disconnect_callbacks: Arc<Mutex<Vec<DisconnectCallback>>>,
}

/// Create two peered transports: `(client, server)`.
///
/// Each side has a fresh UUID client id; the server side stamps inbound
/// messages with the client side's id, matching what network server
/// transports do after deserialization.
pub fn create_pair(
    options: InProcessOptions,
) -> (Arc<InProcessTransport>, Arc<InProcessTransport>) {
    let client_id = Uuid::new_v4().to_string();
    let server_id = Uuid::new_v4().to_string();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();

    let client = Arc::new(InProcessTransport {
        shared: Arc::new(TransportShared::new("in-process-client")),
        options: options.clone(),
        client_id: client_id.clone(),
        peer_client_id: server_id.clone(),
        stamp_inbound: false,
        started: AtomicBool::new(false),
        outbound: Mutex::new(Some(to_server_tx)),
        inbound: Mutex::new(Some(to_client_rx)),
        reader: Mutex::new(None),
        disconnect_callbacks: Arc::new(Mutex::new(Vec::new())),
    });
    let server = Arc::new(InProcessTransport {
        shared: Arc::new(TransportShared::new("in-process-server")),
        options,
        client_id: server_id,
        peer_client_id: client_id,
        stamp_inbound: true,
        started: AtomicBool::new(false),
        outbound: Mutex::new(Some(to_client_tx)),
        inbound: Mutex::new(Some(to_server_rx)),
        reader: Mutex::new(None),
        disconnect_callbacks: Arc::new(Mutex::new(Vec::new())),
    });
    (client, server)
}

impl InProcessTransport {
    /// This side's UUID client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The paired side's UUID client id.
    pub fn peer_client_id(&self) -> &str {
        &self.peer_client_id
    }

    /// Observe the paired peer closing (server side). The handler receives
    /// the peer's client id.
    pub fn on_client_disconnect(&self, handler: DisconnectCallback) {
        self.disconnect_callbacks.lock().push(handler);
    }
}

/// Apply the `clone_messages` option: a JSON round-trip stands in for the
/// deep copy a network hop would provide.
fn wire_clone(msg: HubMessage) -> Option<HubMessage> {
    let client_id = msg.client_id.clone();
    let text = match msg.to_wire() {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(%err, "in-process clone serialization failed, dropping");
            return None;
        }
    };
    match HubMessage::from_wire(&text) {
        Ok(mut clone) => {
            clone.client_id = client_id;
            Some(clone)
        }
        Err(err) => {
            tracing::warn!(%err, "in-process clone parse failed, dropping");
            None
        }
    }
}

impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let Some(mut inbound) = self.inbound.lock().take() else {
                // Already initialized; keep the call idempotent.
                return Ok(());
            };

            let shared = Arc::clone(&self.shared);
            let options = self.options.clone();
            let stamp = self.stamp_inbound.then(|| self.peer_client_id.clone());
            let peer_id = self.peer_client_id.clone();
            let disconnect_callbacks = Arc::clone(&self.disconnect_callbacks);

            let reader = tokio::spawn(async move {
                while let Some(mut msg) = inbound.recv().await {
                    if let Some(latency) = options.simulated_latency {
                        tokio::time::sleep(latency).await;
                    }
                    if options.clone_messages {
                        match wire_clone(msg) {
                            Some(clone) => msg = clone,
                            None => continue,
                        }
                    }
                    if let Some(ref client_id) = stamp {
                        msg.client_id = Some(client_id.clone());
                    }
                    shared.emit(msg);
                }
                // Peer dropped its sender: it closed.
                shared.set_state(TransportState::Disconnected, Some("peer closed".to_owned()));
                let callbacks: Vec<DisconnectCallback> =
                    disconnect_callbacks.lock().iter().map(Arc::clone).collect();
                for cb in callbacks {
                    cb(peer_id.clone());
                }
            });
            *self.reader.lock() = Some(reader);
            self.started.store(true, Ordering::Release);
            self.shared.set_state(TransportState::Connected, None);
            Ok(())
        })
    }

    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if !self.started.load(Ordering::Acquire) {
                return Err(HubError::not_connected(self.name()));
            }
            if self.shared.state() != TransportState::Connected {
                return Err(HubError::transport("in-process peer is not connected"));
            }
            let sender = self.outbound.lock().clone();
            match sender {
                Some(sender) => sender
                    .send(msg)
                    .map_err(|_| HubError::transport("in-process peer is gone")),
                None => Err(HubError::transport("transport closed")),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            // Dropping the sender lets the peer's reader observe the close.
            self.outbound.lock().take();
            if let Some(reader) = self.reader.lock().take() {
                reader.abort();
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

// -- Bus ----------------------------------------------------------------------

/// Name-keyed registry of in-process transports. `send` on any member fans
/// out to every other member; duplicate names are rejected.
#[derive(Default)]
pub struct InProcessBus {
    members: Mutex<HashMap<String, Arc<TransportShared>>>,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new member under `name`.
    pub fn attach(
        self: &Arc<Self>,
        name: impl Into<String>,
    ) -> Result<Arc<BusTransport>, HubError> {
        let name = name.into();
        let shared = Arc::new(TransportShared::new(name.clone()));
        let mut members = self.members.lock();
        if members.contains_key(&name) {
            return Err(HubError::new(
                ErrorCode::TransportError,
                format!("duplicate bus transport name: {name}"),
            ));
        }
        members.insert(name.clone(), Arc::clone(&shared));
        drop(members);
        Ok(Arc::new(BusTransport { bus: Arc::clone(self), name, shared }))
    }

    fn detach(&self, name: &str) {
        self.members.lock().remove(name);
    }

    fn fan_out(&self, sender: &str, msg: &HubMessage) {
        let others: Vec<Arc<TransportShared>> = self
            .members
            .lock()
            .iter()
            .filter(|(name, _)| name.as_str() != sender)
            .map(|(_, shared)| Arc::clone(shared))
            .collect();
        for shared in others {
            shared.emit(msg.clone());
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }
}

/// One member of an [`InProcessBus`].
pub struct BusTransport {
    bus: Arc<InProcessBus>,
    name: String,
    shared: Arc<TransportShared>,
}

impl std::fmt::Debug for BusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransport").field("name", &self.name).finish()
    }
}

impl Transport for BusTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.shared.set_state(TransportState::Connected, None);
            Ok(())
        })
    }

    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if !self.is_ready() {
                return Err(HubError::not_connected(&self.name));
            }
            self.bus.fan_out(&self.name, &msg);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.bus.detach(&self.name);
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
#[path = "in_process_tests.rs"]
mod tests;
