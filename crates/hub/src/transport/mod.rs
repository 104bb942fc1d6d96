// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport capability contract and shared plumbing.
//!
//! Every concrete transport (WebSocket client/server, unix socket, stdio,
//! in-process) satisfies the same [`Transport`] trait; the hub and router
//! only ever hold transports behind it. Framing, parsing, and validation
//! happen inside the transport, so `on_message` handlers may assume
//! well-formed [`HubMessage`]s.

pub mod in_process;
pub mod stdio;
pub mod unix;
pub mod ws_client;
pub mod ws_server;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::HubError;
use crate::protocol::HubMessage;

/// Boxed future used for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Handler invoked for every validated inbound message.
pub type MessageCallback = Arc<dyn Fn(HubMessage) + Send + Sync>;

/// Observer invoked by server-side transports when one client disconnects,
/// with the client id that went away.
pub type DisconnectCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Handler invoked on every state transition, with an optional error detail.
pub type ConnectionCallback = Arc<dyn Fn(TransportState, Option<String>) + Send + Sync>;

/// Opaque handle returned by `on_message` / `on_connection_change`;
/// pass it back to the matching `off_*` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Capability set every transport must satisfy.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Connect or accept; transitions state to `Connected` on success.
    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>>;

    /// Serialize and deliver one message.
    ///
    /// Fails with `NOT_CONNECTED` before [`Transport::initialize`] and with
    /// `TRANSPORT_ERROR` once the connection has dropped.
    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>>;

    /// Quiesce and transition to `Disconnected`. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<(), HubError>>;

    fn state(&self) -> TransportState;

    fn is_ready(&self) -> bool {
        self.state() == TransportState::Connected
    }

    fn on_message(&self, callback: MessageCallback) -> CallbackId;
    fn off_message(&self, id: CallbackId);

    fn on_connection_change(&self, callback: ConnectionCallback) -> CallbackId;
    fn off_connection_change(&self, id: CallbackId);
}

/// State cell + callback registries embedded by every concrete transport.
///
/// Locks are only held for registry mutation and snapshotting, never across
/// an await point.
pub struct TransportShared {
    name: String,
    state: Mutex<TransportState>,
    message_callbacks: Mutex<Vec<(CallbackId, MessageCallback)>>,
    connection_callbacks: Mutex<Vec<(CallbackId, ConnectionCallback)>>,
    next_id: Mutex<u64>,
}

impl TransportShared {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TransportState::Disconnected),
            message_callbacks: Mutex::new(Vec::new()),
            connection_callbacks: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn next_id(&self) -> CallbackId {
        let mut guard = self.next_id.lock();
        let id = CallbackId(*guard);
        *guard += 1;
        id
    }

    pub fn add_message_callback(&self, callback: MessageCallback) -> CallbackId {
        let id = self.next_id();
        self.message_callbacks.lock().push((id, callback));
        id
    }

    pub fn remove_message_callback(&self, id: CallbackId) {
        self.message_callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
    }

    pub fn add_connection_callback(&self, callback: ConnectionCallback) -> CallbackId {
        let id = self.next_id();
        self.connection_callbacks.lock().push((id, callback));
        id
    }

    pub fn remove_connection_callback(&self, id: CallbackId) {
        self.connection_callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
    }

    /// Deliver one validated message to every registered handler.
    pub fn emit(&self, msg: HubMessage) {
        let callbacks: Vec<MessageCallback> =
            self.message_callbacks.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        match callbacks.split_last() {
            Some((last, rest)) => {
                for cb in rest {
                    cb(msg.clone());
                }
                last(msg);
            }
            None => {
                tracing::trace!(transport = %self.name, id = %msg.id, "message dropped, no handlers");
            }
        }
    }

    /// Transition state and notify connection-change handlers.
    ///
    /// No-op when the state is unchanged, so reconnect loops can set
    /// `Connecting` repeatedly without spamming observers.
    pub fn set_state(&self, next: TransportState, error: Option<String>) {
        {
            let mut guard = self.state.lock();
            if *guard == next {
                return;
            }
            *guard = next;
        }
        tracing::debug!(transport = %self.name, state = next.as_str(), "transport state change");
        let callbacks: Vec<ConnectionCallback> =
            self.connection_callbacks.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for cb in callbacks {
            cb(next, error.clone());
        }
    }
}

/// Decode one NDJSON line into a validated message.
///
/// Tolerates `\r\n` line endings, skips empty lines, and logs-and-drops
/// lines that fail to parse or validate. Shared by the unix-socket and
/// stdio transports.
pub fn decode_line(transport: &str, line: &str) -> Option<HubMessage> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }
    match HubMessage::from_wire(line) {
        Ok(msg) => Some(msg),
        Err(err) => {
            tracing::warn!(transport, %err, "dropping undecodable line");
            None
        }
    }
}

/// Serialize one message as an `\n`-terminated NDJSON line.
pub fn encode_line(msg: &HubMessage) -> Result<String, HubError> {
    let mut line = msg.to_wire()?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
