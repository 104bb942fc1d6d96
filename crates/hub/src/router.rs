// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server-side subscription index and event fan-out engine.
//!
//! The router owns the only strong references to client connections; the
//! hub keeps just the `clientId` and looks connections up on demand.
//! Subscriptions are indexed twice: by `(sessionId, method)` for fan-out,
//! and per client for disconnect cleanup, so both paths stay
//! O(subscribers). The router holds no state across process restarts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ErrorCode, HubError};
use crate::protocol::{validate_method, validate_session_id, HubMessage, MessageType};

/// Opaque delivery handle the router uses to push bytes to one client.
///
/// `id` must be stable for the lifetime of the connection. `send` is a
/// non-blocking enqueue; a send that cannot complete reports failure.
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> &str;
    fn send(&self, text: &str) -> Result<(), HubError>;
    fn is_open(&self) -> bool;
    fn metadata(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Per-event fan-out accounting. `sent + failed == total_subscribers`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub sent: usize,
    pub failed: usize,
    pub total_subscribers: usize,
}

/// Broadcast accounting across every known client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Log per-event fan-out counts at debug verbosity.
    pub debug: bool,
}

#[derive(Default)]
pub struct Router {
    config: RouterConfig,
    clients: RwLock<HashMap<String, Arc<dyn ClientConnection>>>,
    /// sessionId → method → subscriber client ids.
    subscriptions: RwLock<HashMap<String, HashMap<String, HashSet<String>>>>,
    /// clientId → sessionId → methods (reverse index for cleanup).
    client_subscriptions: RwLock<HashMap<String, HashMap<String, HashSet<String>>>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Register a connection; idempotent by `conn.id()`.
    ///
    /// Repeat calls with the same id return the same client id without
    /// duplicating state (the original connection is kept).
    pub fn register_connection(&self, conn: Arc<dyn ClientConnection>) -> String {
        let client_id = conn.id().to_owned();
        let mut clients = self.clients.write();
        if !clients.contains_key(&client_id) {
            clients.insert(client_id.clone(), conn);
            tracing::info!(client_id = %client_id, total = clients.len(), "client registered");
        }
        client_id
    }

    /// Remove a client and cascade through the subscription index, deleting
    /// any inner containers that became empty.
    pub fn unregister_connection(&self, client_id: &str) {
        let removed = self.clients.write().remove(client_id).is_some();

        let by_session = self.client_subscriptions.write().remove(client_id);
        if let Some(by_session) = by_session {
            let mut subs = self.subscriptions.write();
            for (session_id, methods) in by_session {
                let Some(method_map) = subs.get_mut(&session_id) else { continue };
                for method in methods {
                    if let Some(subscribers) = method_map.get_mut(&method) {
                        subscribers.remove(client_id);
                        if subscribers.is_empty() {
                            method_map.remove(&method);
                        }
                    }
                }
                if method_map.is_empty() {
                    subs.remove(&session_id);
                }
            }
        }

        if removed {
            tracing::info!(client_id, "client unregistered");
        }
    }

    pub fn get_client_by_id(&self, client_id: &str) -> Option<Arc<dyn ClientConnection>> {
        self.clients.read().get(client_id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Record a subscription in both indices.
    pub fn subscribe(&self, session_id: &str, method: &str, client_id: &str) -> Result<(), HubError> {
        if !validate_session_id(session_id) {
            return Err(HubError::new(
                ErrorCode::InvalidSession,
                format!("invalid session id: {session_id:?}"),
            ));
        }
        if !validate_method(method) {
            return Err(HubError::invalid_method(method));
        }

        self.subscriptions
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .entry(method.to_owned())
            .or_default()
            .insert(client_id.to_owned());
        self.client_subscriptions
            .write()
            .entry(client_id.to_owned())
            .or_default()
            .entry(session_id.to_owned())
            .or_default()
            .insert(method.to_owned());

        tracing::debug!(client_id, session_id, method, "subscription added");
        Ok(())
    }

    /// Remove a subscription from both indices, reaping empty containers.
    pub fn unsubscribe_client(&self, session_id: &str, method: &str, client_id: &str) {
        let mut subs = self.subscriptions.write();
        if let Some(method_map) = subs.get_mut(session_id) {
            if let Some(subscribers) = method_map.get_mut(method) {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    method_map.remove(method);
                }
            }
            if method_map.is_empty() {
                subs.remove(session_id);
            }
        }
        drop(subs);

        let mut reverse = self.client_subscriptions.write();
        if let Some(by_session) = reverse.get_mut(client_id) {
            if let Some(methods) = by_session.get_mut(session_id) {
                methods.remove(method);
                if methods.is_empty() {
                    by_session.remove(session_id);
                }
            }
            if by_session.is_empty() {
                reverse.remove(client_id);
            }
        }

        tracing::debug!(client_id, session_id, method, "subscription removed");
    }

    /// Number of subscribers on `(sessionId, method)`.
    pub fn subscription_count(&self, session_id: &str, method: &str) -> usize {
        self.subscriptions
            .read()
            .get(session_id)
            .and_then(|methods| methods.get(method))
            .map_or(0, HashSet::len)
    }

    /// Fan one EVENT out to every subscriber of `(sessionId, method)`.
    ///
    /// The message is serialized once; the subscriber set is snapshotted so
    /// handler-induced index mutation during delivery cannot skew the walk.
    /// Delivery is best-effort, at-most-once: a closed or broken connection
    /// counts as failed. Non-EVENT inputs return a zero report.
    pub fn route_event(&self, msg: &HubMessage) -> RouteReport {
        if msg.msg_type != MessageType::Event {
            tracing::debug!(msg_type = ?msg.msg_type, "route_event ignoring non-EVENT message");
            return RouteReport::default();
        }

        let subscribers: Vec<String> = self
            .subscriptions
            .read()
            .get(&msg.session_id)
            .and_then(|methods| methods.get(&msg.method))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut report =
            RouteReport { sent: 0, failed: 0, total_subscribers: subscribers.len() };
        if subscribers.is_empty() {
            return report;
        }

        let text = match msg.to_wire() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%err, method = %msg.method, "event serialization failed");
                report.failed = report.total_subscribers;
                return report;
            }
        };

        for client_id in &subscribers {
            match self.get_client_by_id(client_id) {
                Some(conn) if conn.is_open() => match conn.send(&text) {
                    Ok(()) => report.sent += 1,
                    Err(err) => {
                        tracing::debug!(client_id = %client_id, %err, "event delivery failed");
                        report.failed += 1;
                    }
                },
                _ => report.failed += 1,
            }
        }

        if self.config.debug {
            tracing::debug!(
                session_id = %msg.session_id,
                method = %msg.method,
                sent = report.sent,
                failed = report.failed,
                total = report.total_subscribers,
                "event fan-out"
            );
        }
        report
    }

    /// Deliver one message to one client. Returns whether the send succeeded.
    pub fn send_to_client(&self, client_id: &str, msg: &HubMessage) -> bool {
        let Some(conn) = self.get_client_by_id(client_id) else {
            tracing::debug!(client_id, "send_to_client: unknown client");
            return false;
        };
        if !conn.is_open() {
            return false;
        }
        let text = match msg.to_wire() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%err, "message serialization failed");
                return false;
            }
        };
        conn.send(&text).is_ok()
    }

    /// Send to every known client regardless of subscription, gated on
    /// `is_open`.
    pub fn broadcast(&self, msg: &HubMessage) -> BroadcastReport {
        let clients: Vec<Arc<dyn ClientConnection>> =
            self.clients.read().values().cloned().collect();
        let text = match msg.to_wire() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%err, "broadcast serialization failed");
                return BroadcastReport { sent: 0, failed: clients.len() };
            }
        };

        let mut report = BroadcastReport::default();
        for conn in clients {
            if conn.is_open() && conn.send(&text).is_ok() {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Reserved extension point for router-level message handling.
    pub fn handle_message(&self, _msg: &HubMessage, _client_id: &str) {}
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
