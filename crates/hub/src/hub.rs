// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-peer multiplexer: RPC calls, events, subscriptions, and
//! PING/PONG over one registered transport.
//!
//! One dispatch task per hub drains an inbound queue fed by the registered
//! transport's `on_message` callback (and [`MessageHub::inject`]). That
//! single consumer is what serializes dispatch: handlers for one EVENT run
//! to completion, in registration order, before the next message is looked
//! at.
//!
//! All tables live behind `parking_lot` locks held only across state
//! transitions, never across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::ChannelManager;
use crate::error::{ErrorCode, HubError};
use crate::protocol::{validate_method, HubMessage, MessageType};
use crate::router::Router;
use crate::transport::{BoxFuture, CallbackId, Transport, TransportState};

/// Methods reserved for channel membership, handled inside the hub.
const ROOM_JOIN: &str = "room.join";
const ROOM_LEAVE: &str = "room.leave";

/// Hub construction options.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Session id used when a caller omits one.
    pub default_session_id: String,
    /// Backpressure cap on concurrent outbound RPCs.
    pub max_pending_calls: usize,
    /// Recursion bound on EVENT dispatch per message id.
    pub max_event_depth: u32,
    /// Default timeout for [`MessageHub::request`].
    pub request_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_session_id: crate::protocol::GLOBAL_SESSION.to_owned(),
            max_pending_calls: 10_000,
            max_event_depth: 16,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub session_id: Option<String>,
    /// Perform the SUBSCRIBE/SUBSCRIBED handshake with the remote peer.
    /// Without it the subscription is recorded locally only (optimistic).
    pub ack: bool,
}

/// Context handed to a request handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub session_id: String,
    /// Present when the CALL arrived through a server-side transport.
    pub client_id: Option<String>,
    pub data: Value,
}

/// The sole server-side handler for one method within this peer.
pub type RequestHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<Value, HubError>> + Send + Sync>;

/// A local listener for inbound EVENTs. Errors are logged and contained;
/// neither sibling handlers nor the hub fail.
pub type EventHandler =
    Arc<dyn Fn(HubMessage) -> BoxFuture<'static, Result<(), HubError>> + Send + Sync>;

/// Adapt an async closure into a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HubError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Adapt an async closure into an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(HubMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HubError>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Handle identifying one local subscription, for [`MessageHub::unsubscribe`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    session_id: String,
    method: String,
}

impl SubscriptionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

struct LocalSubscription {
    id: u64,
    handler: EventHandler,
    acked: bool,
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value, HubError>>,
}

struct TransportSlot {
    transport: Arc<dyn Transport>,
    msg_cb: CallbackId,
    conn_cb: CallbackId,
}

struct RouterAttachment {
    router: Arc<Router>,
    channels: Arc<ChannelManager>,
}

/// The per-peer RPC/event multiplexer. Cheap to share via `Arc`.
///
/// Construct inside a tokio runtime: the hub spawns its dispatch task at
/// creation and feeds it from the registered transport (and
/// [`MessageHub::inject`]).
pub struct MessageHub {
    config: HubConfig,
    inbound_tx: mpsc::UnboundedSender<HubMessage>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    transport: Mutex<Option<TransportSlot>>,
    attachment: Mutex<Option<RouterAttachment>>,
    pending: Mutex<HashMap<String, PendingCall>>,
    /// SUBSCRIBE/UNSUBSCRIBE handshakes awaiting their ack, by request id.
    pending_acks: Mutex<HashMap<String, oneshot::Sender<Result<(), HubError>>>>,
    /// (sessionId, method) → local subscriptions, insertion-ordered.
    subscriptions: Mutex<HashMap<(String, String), Vec<LocalSubscription>>>,
    /// method → additional local EVENT listeners, any session.
    event_listeners: Mutex<HashMap<String, Vec<EventHandler>>>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    /// EVENT message id → live dispatch depth (recursion bound).
    event_depth: Mutex<HashMap<String, u32>>,
    /// Outbound per-session sequence counters.
    outbound_seq: Mutex<HashMap<String, u64>>,
    /// Inbound high-water marks per (clientId, sessionId).
    inbound_seq: Mutex<HashMap<(String, String), u64>>,
    next_sub_id: Mutex<u64>,
    last_pong: Mutex<Option<Instant>>,
}

impl MessageHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<HubMessage>();
        let hub = Arc::new(Self {
            config,
            inbound_tx,
            dispatch: Mutex::new(None),
            transport: Mutex::new(None),
            attachment: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            event_listeners: Mutex::new(HashMap::new()),
            request_handlers: Mutex::new(HashMap::new()),
            event_depth: Mutex::new(HashMap::new()),
            outbound_seq: Mutex::new(HashMap::new()),
            inbound_seq: Mutex::new(HashMap::new()),
            next_sub_id: Mutex::new(1),
            last_pong: Mutex::new(None),
        });

        let weak = Arc::downgrade(&hub);
        let dispatch = tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                let Some(hub) = weak.upgrade() else { break };
                hub.handle_message(msg).await;
            }
        });
        *hub.dispatch.lock() = Some(dispatch);
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Install the single send path and subscribe to its inbound stream.
    ///
    /// Rejects a second registration unless [`MessageHub::cleanup`] ran in
    /// between. Register before calling the transport's `initialize` so no
    /// early inbound message is dropped.
    pub fn register_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), HubError> {
        let mut slot = self.transport.lock();
        if slot.is_some() {
            return Err(HubError::new(
                ErrorCode::TransportError,
                "a transport is already registered; call cleanup() first",
            ));
        }

        let inbound_tx = self.inbound_tx.clone();
        let msg_cb = transport.on_message(Arc::new(move |msg| {
            let _ = inbound_tx.send(msg);
        }));

        let weak = Arc::downgrade(self);
        let conn_cb = transport.on_connection_change(Arc::new(move |state, error| {
            let Some(hub) = weak.upgrade() else { return };
            if matches!(state, TransportState::Disconnected | TransportState::Error) {
                let detail = error.unwrap_or_else(|| "transport disconnected".to_owned());
                hub.fail_all_pending(&HubError::transport(detail));
            }
        }));

        *slot = Some(TransportSlot { transport, msg_cb, conn_cb });
        Ok(())
    }

    /// Enqueue a message into this hub's dispatch queue as if it arrived
    /// from the registered transport. Used by secondary server transports
    /// and tests.
    pub fn inject(&self, msg: HubMessage) {
        let _ = self.inbound_tx.send(msg);
    }

    /// Attach the server-side router and channel manager.
    pub fn attach_router(&self, router: Arc<Router>, channels: Arc<ChannelManager>) {
        *self.attachment.lock() = Some(RouterAttachment { router, channels });
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        self.attachment.lock().as_ref().map(|att| Arc::clone(&att.router))
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().as_ref().map(|slot| Arc::clone(&slot.transport))
    }

    /// Issue a CALL and await the matching RESULT or ERROR.
    ///
    /// Fails fast with `INVALID_METHOD` on a bad name, `NOT_CONNECTED`
    /// without a transport, `TRANSPORT_ERROR` at the pending-call cap, and
    /// `TIMEOUT` when the deadline elapses.
    pub async fn request(
        &self,
        method: &str,
        data: Value,
        opts: RequestOptions,
    ) -> Result<Value, HubError> {
        if !validate_method(method) {
            return Err(HubError::invalid_method(method));
        }
        let session_id =
            opts.session_id.unwrap_or_else(|| self.config.default_session_id.clone());
        let timeout = opts.timeout.unwrap_or(self.config.request_timeout);
        let transport = self
            .current_transport()
            .ok_or_else(|| HubError::new(ErrorCode::NotConnected, "no transport registered"))?;

        let mut msg =
            HubMessage::call(method, &session_id, if data.is_null() { None } else { Some(data) });
        msg.sequence = Some(self.next_sequence(&session_id));
        let call_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.config.max_pending_calls {
                return Err(HubError::new(
                    ErrorCode::TransportError,
                    format!(
                        "Too many pending calls ({}), rejecting {method}",
                        pending.len()
                    ),
                ));
            }
            pending.insert(call_id.clone(), PendingCall { method: method.to_owned(), tx });
        }

        if let Err(err) = transport.send(msg).await {
            self.pending.lock().remove(&call_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::transport("pending call dropped")),
            Err(_) => {
                self.pending.lock().remove(&call_id);
                Err(HubError::new(
                    ErrorCode::Timeout,
                    format!("Request timeout after {}ms: {method}", timeout.as_millis()),
                ))
            }
        }
    }

    /// Fire a one-way EVENT. Never awaits acknowledgement.
    pub async fn event(&self, method: &str, data: Value, opts: EventOptions) -> Result<(), HubError> {
        if !validate_method(method) {
            return Err(HubError::invalid_method(method));
        }
        let session_id =
            opts.session_id.unwrap_or_else(|| self.config.default_session_id.clone());
        let msg = HubMessage::event(method, session_id, if data.is_null() { None } else { Some(data) });
        self.emit(msg).await
    }

    /// Emit a pre-built EVENT message (deliberate id reuse, custom fields).
    ///
    /// Dispatches to this peer's own matching subscribers, then fans out
    /// through the attached router (server) or the registered transport
    /// (client).
    pub async fn emit(&self, mut msg: HubMessage) -> Result<(), HubError> {
        if msg.msg_type != MessageType::Event {
            return Err(HubError::new(ErrorCode::InvalidMessage, "emit() requires an EVENT message"));
        }
        if !validate_method(&msg.method) {
            return Err(HubError::invalid_method(&msg.method));
        }
        if msg.sequence.is_none() {
            msg.sequence = Some(self.next_sequence(&msg.session_id));
        }

        self.dispatch_event(&msg).await;

        let routed = {
            let guard = self.attachment.lock();
            guard.as_ref().map(|att| Arc::clone(&att.router))
        };
        if let Some(router) = routed {
            router.route_event(&msg);
            return Ok(());
        }
        if let Some(transport) = self.current_transport() {
            return transport.send(msg).await;
        }
        Ok(())
    }

    /// Register a local event handler for `(sessionId, method)`.
    ///
    /// With `ack`, performs the SUBSCRIBE handshake and resolves on
    /// SUBSCRIBED; otherwise records locally only.
    pub async fn subscribe(
        &self,
        method: &str,
        handler: EventHandler,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle, HubError> {
        if !validate_method(method) {
            return Err(HubError::invalid_method(method));
        }
        let session_id =
            opts.session_id.unwrap_or_else(|| self.config.default_session_id.clone());
        let id = {
            let mut guard = self.next_sub_id.lock();
            let id = *guard;
            *guard += 1;
            id
        };
        let key = (session_id.clone(), method.to_owned());
        self.subscriptions
            .lock()
            .entry(key.clone())
            .or_default()
            .push(LocalSubscription { id, handler, acked: false });
        let handle = SubscriptionHandle { id, session_id: session_id.clone(), method: method.to_owned() };

        if !opts.ack {
            return Ok(handle);
        }

        match self.handshake(HubMessage::subscribe(method, &session_id)).await {
            Ok(()) => {
                if let Some(subs) = self.subscriptions.lock().get_mut(&key) {
                    if let Some(sub) = subs.iter_mut().find(|sub| sub.id == id) {
                        sub.acked = true;
                    }
                }
                Ok(handle)
            }
            Err(err) => {
                self.remove_subscription(&handle);
                Err(err)
            }
        }
    }

    /// Send a SUBSCRIBE/UNSUBSCRIBE and await its ack.
    async fn handshake(&self, mut msg: HubMessage) -> Result<(), HubError> {
        let transport = self
            .current_transport()
            .ok_or_else(|| HubError::new(ErrorCode::NotConnected, "no transport registered"))?;
        msg.sequence = Some(self.next_sequence(&msg.session_id));
        let request_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().insert(request_id.clone(), tx);

        if let Err(err) = transport.send(msg).await {
            self.pending_acks.lock().remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::transport("subscription handshake dropped")),
            Err(_) => {
                self.pending_acks.lock().remove(&request_id);
                Err(HubError::new(ErrorCode::Timeout, "subscription handshake timed out"))
            }
        }
    }

    fn remove_subscription(&self, handle: &SubscriptionHandle) -> Option<bool> {
        let key = (handle.session_id.clone(), handle.method.clone());
        let mut subs = self.subscriptions.lock();
        let entries = subs.get_mut(&key)?;
        let index = entries.iter().position(|sub| sub.id == handle.id)?;
        let removed = entries.remove(index);
        let ack_remains = entries.iter().any(|sub| sub.acked);
        if entries.is_empty() {
            subs.remove(&key);
        }
        Some(removed.acked && !ack_remains)
    }

    /// Remove one local handler; notifies the remote peer when this was the
    /// last acknowledged subscription on its `(sessionId, method)`.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), HubError> {
        let Some(notify_remote) = self.remove_subscription(handle) else {
            return Ok(());
        };
        if notify_remote {
            self.handshake(HubMessage::unsubscribe(&handle.method, &handle.session_id)).await?;
        }
        Ok(())
    }

    /// Drop every local subscription; best-effort UNSUBSCRIBEs for keys
    /// that had completed the handshake.
    pub async fn unsubscribe_all(&self) {
        let acked: Vec<(String, String)> = {
            let mut subs = self.subscriptions.lock();
            let acked = subs
                .iter()
                .filter(|(_, entries)| entries.iter().any(|sub| sub.acked))
                .map(|(key, _)| key.clone())
                .collect();
            subs.clear();
            acked
        };
        let Some(transport) = self.current_transport() else { return };
        for (session_id, method) in acked {
            let mut msg = HubMessage::unsubscribe(&method, &session_id);
            msg.sequence = Some(self.next_sequence(&session_id));
            if let Err(err) = transport.send(msg).await {
                tracing::debug!(%err, method = %method, "unsubscribe_all send failed");
            }
        }
    }

    /// Register the sole RPC handler for `method`. Re-registration replaces.
    pub fn on_request(&self, method: &str, handler: RequestHandler) -> Result<(), HubError> {
        if !validate_method(method) {
            return Err(HubError::invalid_method(method));
        }
        self.request_handlers.lock().insert(method.to_owned(), handler);
        Ok(())
    }

    /// Register an additional local listener for inbound EVENTs on
    /// `method`, regardless of session.
    pub fn on_event(&self, method: &str, handler: EventHandler) -> Result<(), HubError> {
        if !validate_method(method) {
            return Err(HubError::invalid_method(method));
        }
        self.event_listeners.lock().entry(method.to_owned()).or_default().push(handler);
        Ok(())
    }

    /// Cancel all pending calls, clear subscriptions and depth maps, reset
    /// sequence counters, and detach the transport. Idempotent and final
    /// for the registration (a new transport may be registered afterwards).
    pub fn cleanup(&self) {
        if let Some(slot) = self.transport.lock().take() {
            slot.transport.off_message(slot.msg_cb);
            slot.transport.off_connection_change(slot.conn_cb);
        }
        self.fail_all_pending(&HubError::transport("hub cleanup"));
        self.subscriptions.lock().clear();
        self.event_listeners.lock().clear();
        self.event_depth.lock().clear();
        self.outbound_seq.lock().clear();
        self.inbound_seq.lock().clear();
    }

    pub fn pending_call_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Instant of the most recent PONG, for liveness monitoring.
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }

    /// Drop inbound sequence state for a disconnected client.
    pub fn cleanup_client_sequence(&self, client_id: &str) {
        self.inbound_seq.lock().retain(|(client, _), _| client != client_id);
    }

    fn next_sequence(&self, session_id: &str) -> u64 {
        let mut guard = self.outbound_seq.lock();
        let counter = guard.entry(session_id.to_owned()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn check_sequence(&self, client_id: &str, session_id: &str, sequence: u64) {
        let key = (client_id.to_owned(), session_id.to_owned());
        let mut guard = self.inbound_seq.lock();
        match guard.get(&key) {
            Some(&last) if sequence <= last => {
                tracing::warn!(
                    client_id,
                    session_id,
                    sequence,
                    last,
                    "duplicate or reordered message"
                );
            }
            Some(&last) if sequence > last + 1 => {
                tracing::warn!(client_id, session_id, sequence, last, "sequence gap, possible loss");
                guard.insert(key, sequence);
            }
            _ => {
                guard.insert(key, sequence);
            }
        }
    }

    fn fail_all_pending(&self, err: &HubError) {
        let drained: Vec<PendingCall> =
            self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in drained {
            tracing::debug!(method = %call.method, code = err.code.as_str(), "rejecting pending call");
            let _ = call.tx.send(Err(err.clone()));
        }
        let acks: Vec<oneshot::Sender<Result<(), HubError>>> =
            self.pending_acks.lock().drain().map(|(_, tx)| tx).collect();
        for tx in acks {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Inbound dispatch for one validated message.
    async fn handle_message(&self, msg: HubMessage) {
        if let Some(sequence) = msg.sequence {
            let client = msg.client_id.as_deref().unwrap_or("remote");
            self.check_sequence(client, &msg.session_id, sequence);
        }

        match msg.msg_type {
            MessageType::Event => self.handle_event(&msg).await,
            MessageType::Call => self.handle_call(msg).await,
            MessageType::Result | MessageType::Error => self.handle_response(&msg),
            MessageType::Subscribe | MessageType::Unsubscribe => {
                self.handle_subscription_request(&msg).await;
            }
            MessageType::Subscribed | MessageType::Unsubscribed => {
                self.handle_ack(&msg);
            }
            MessageType::Ping => {
                let pong = HubMessage::pong(&msg.session_id, &msg.id);
                self.respond(&msg, pong).await;
            }
            MessageType::Pong => {
                *self.last_pong.lock() = Some(Instant::now());
            }
        }
    }

    async fn handle_event(&self, msg: &HubMessage) {
        self.dispatch_event(msg).await;

        // Server side: relay to subscribers and to channel members.
        let attachment = {
            let guard = self.attachment.lock();
            guard
                .as_ref()
                .map(|att| (Arc::clone(&att.router), Arc::clone(&att.channels)))
        };
        let Some((router, channels)) = attachment else { return };

        if msg.client_id.is_some() {
            router.route_event(msg);
        }
        let channel = msg
            .data
            .as_ref()
            .and_then(|data| data.get("channel"))
            .and_then(Value::as_str);
        if let Some(channel) = channel {
            for member in channels.channel_members(channel) {
                if msg.client_id.as_deref() == Some(member.as_str()) {
                    continue;
                }
                router.send_to_client(&member, msg);
            }
        }
    }

    /// Dispatch one EVENT to local subscribers and listeners, bounded by
    /// `max_event_depth` per message id to terminate diamond or cyclic
    /// re-emission. The depth entry is released on every exit path.
    fn dispatch_event<'a>(&'a self, msg: &'a HubMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let depth = {
                let mut guard = self.event_depth.lock();
                let depth = guard.entry(msg.id.clone()).or_insert(0);
                *depth += 1;
                *depth
            };
            if depth > self.config.max_event_depth {
                tracing::warn!(
                    id = %msg.id,
                    method = %msg.method,
                    depth,
                    "event recursion bound reached, dropping"
                );
                self.release_depth(&msg.id);
                return;
            }

            let mut handlers: Vec<EventHandler> = Vec::new();
            {
                let key = (msg.session_id.clone(), msg.method.clone());
                let subs = self.subscriptions.lock();
                if let Some(entries) = subs.get(&key) {
                    handlers.extend(entries.iter().map(|sub| Arc::clone(&sub.handler)));
                }
            }
            {
                let listeners = self.event_listeners.lock();
                if let Some(entries) = listeners.get(&msg.method) {
                    handlers.extend(entries.iter().map(Arc::clone));
                }
            }

            for handler in handlers {
                if let Err(err) = handler(msg.clone()).await {
                    tracing::warn!(
                        method = %msg.method,
                        session_id = %msg.session_id,
                        %err,
                        "event handler failed"
                    );
                }
            }
            self.release_depth(&msg.id);
        })
    }

    fn release_depth(&self, id: &str) {
        let mut guard = self.event_depth.lock();
        if let Some(depth) = guard.get_mut(id) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                guard.remove(id);
            }
        }
    }

    async fn handle_call(&self, msg: HubMessage) {
        if msg.method == ROOM_JOIN || msg.method == ROOM_LEAVE {
            if self.handle_room_call(&msg).await {
                return;
            }
        }

        let handler = self.request_handlers.lock().get(&msg.method).cloned();
        let response = match handler {
            None => HubMessage::error(
                &msg.method,
                &msg.session_id,
                &msg.id,
                format!("no handler registered for method {}", msg.method),
                Some(ErrorCode::MethodNotFound),
            ),
            Some(handler) => {
                let ctx = RequestContext {
                    method: msg.method.clone(),
                    session_id: msg.session_id.clone(),
                    client_id: msg.client_id.clone(),
                    data: msg.data.clone().unwrap_or(Value::Null),
                };
                match handler(ctx).await {
                    Ok(value) => HubMessage::result(
                        &msg.method,
                        &msg.session_id,
                        &msg.id,
                        if value.is_null() { None } else { Some(value) },
                    ),
                    Err(err) => HubMessage::error(
                        &msg.method,
                        &msg.session_id,
                        &msg.id,
                        err.message,
                        Some(err.code),
                    ),
                }
            }
        };
        self.respond(&msg, response).await;
    }

    /// Channel membership calls, handled in the hub when a router is
    /// attached and the caller is a known client. Returns whether the call
    /// was consumed.
    async fn handle_room_call(&self, msg: &HubMessage) -> bool {
        let channels = {
            let guard = self.attachment.lock();
            guard.as_ref().map(|att| Arc::clone(&att.channels))
        };
        let (Some(channels), Some(client_id)) = (channels, msg.client_id.clone()) else {
            return false;
        };

        let channel = msg
            .data
            .as_ref()
            .and_then(|data| data.get("channel"))
            .and_then(Value::as_str);
        let response = match channel {
            None => HubMessage::error(
                &msg.method,
                &msg.session_id,
                &msg.id,
                "missing channel in request data",
                Some(ErrorCode::InvalidParams),
            ),
            Some(channel) => {
                let joined = msg.method == ROOM_JOIN;
                if joined {
                    channels.join_channel(&client_id, channel);
                } else {
                    channels.leave_channel(&client_id, channel);
                }
                HubMessage::result(
                    &msg.method,
                    &msg.session_id,
                    &msg.id,
                    Some(serde_json::json!({ "channel": channel, "joined": joined })),
                )
            }
        };
        self.respond(msg, response).await;
        true
    }

    fn handle_response(&self, msg: &HubMessage) {
        let Some(request_id) = msg.request_id.as_deref() else { return };
        let entry = self.pending.lock().remove(request_id);
        let Some(call) = entry else {
            tracing::debug!(request_id, method = %msg.method, "orphan response discarded");
            return;
        };
        let outcome = if msg.msg_type == MessageType::Result {
            Ok(msg.data.clone().unwrap_or(Value::Null))
        } else {
            Err(HubError::new(
                msg.parsed_error_code().unwrap_or(ErrorCode::Internal),
                msg.error.clone().unwrap_or_else(|| "unknown error".to_owned()),
            ))
        };
        let _ = call.tx.send(outcome);
    }

    /// Inbound SUBSCRIBE/UNSUBSCRIBE from a connected client. Requires an
    /// attached router; otherwise logged and dropped.
    async fn handle_subscription_request(&self, msg: &HubMessage) {
        let router = {
            let guard = self.attachment.lock();
            guard.as_ref().map(|att| Arc::clone(&att.router))
        };
        let (Some(router), Some(client_id)) = (router, msg.client_id.clone()) else {
            tracing::debug!(
                method = %msg.method,
                "ignoring subscription request without router or client id"
            );
            return;
        };

        let response = if msg.msg_type == MessageType::Subscribe {
            match router.subscribe(&msg.session_id, &msg.method, &client_id) {
                Ok(()) => HubMessage::subscribed(&msg.method, &msg.session_id, &msg.id),
                Err(err) => HubMessage::error(
                    &msg.method,
                    &msg.session_id,
                    &msg.id,
                    err.message,
                    Some(err.code),
                ),
            }
        } else {
            router.unsubscribe_client(&msg.session_id, &msg.method, &client_id);
            HubMessage::unsubscribed(&msg.method, &msg.session_id, &msg.id)
        };
        self.respond(msg, response).await;
    }

    fn handle_ack(&self, msg: &HubMessage) {
        let Some(request_id) = msg.request_id.as_deref() else { return };
        match self.pending_acks.lock().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(Ok(()));
            }
            None => {
                tracing::debug!(request_id, "orphan subscription ack discarded");
            }
        }
    }

    /// Deliver a response toward the originator of `origin`, preferring the
    /// router path when the origin carries a client id.
    async fn respond(&self, origin: &HubMessage, mut response: HubMessage) {
        response.client_id = origin.client_id.clone();
        response.sequence = Some(self.next_sequence(&response.session_id));

        if let Some(client_id) = origin.client_id.as_deref() {
            let router = {
                let guard = self.attachment.lock();
                guard.as_ref().map(|att| Arc::clone(&att.router))
            };
            if let Some(router) = router {
                if router.send_to_client(client_id, &response) {
                    return;
                }
                tracing::debug!(client_id, "router delivery failed, falling back to transport");
            }
        }

        match self.current_transport() {
            Some(transport) => {
                if let Err(err) = transport.send(response).await {
                    tracing::warn!(%err, "response delivery failed");
                }
            }
            None => tracing::warn!("no delivery path for response"),
        }
    }
}

impl Drop for MessageHub {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.abort();
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
