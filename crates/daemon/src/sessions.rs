// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory session registry backing the `session.*` method family.
//!
//! Sessions here are just records with lifecycle events; anything deeper
//! (agents, models, worktrees) belongs to the applications built on top of
//! the hub. Lifecycle notifications go out as global EVENTs so every
//! subscriber of `("global", "session.*")` sees them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use liuboer::error::{ErrorCode, HubError};
use liuboer::hub::{request_handler, EventOptions, MessageHub, RequestContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, title: &str) -> SessionRecord {
        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            title: title.to_owned(),
            created_at: now(),
            updated_at: now(),
        };
        self.sessions.write().insert(record.session_id.clone(), record.clone());
        tracing::info!(session_id = %record.session_id, title = %record.title, "session created");
        record
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn rename(&self, session_id: &str, title: &str) -> Option<SessionRecord> {
        let mut sessions = self.sessions.write();
        let record = sessions.get_mut(session_id)?;
        record.title = title.to_owned();
        record.updated_at = now();
        Some(record.clone())
    }

    pub fn delete(&self, session_id: &str) -> Option<SessionRecord> {
        let removed = self.sessions.write().remove(session_id);
        if let Some(ref record) = removed {
            tracing::info!(session_id = %record.session_id, "session deleted");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}

fn session_id_param(ctx: &RequestContext) -> Result<String, HubError> {
    ctx.data
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| HubError::new(ErrorCode::InvalidParams, "missing sessionId"))
}

fn not_found(session_id: &str) -> HubError {
    HubError::new(ErrorCode::SessionNotFound, format!("no such session: {session_id}"))
}

/// Fire a global lifecycle EVENT; delivery problems are logged, never fatal.
async fn notify(hub: &Weak<MessageHub>, method: &str, record: &SessionRecord) {
    let Some(hub) = hub.upgrade() else { return };
    let data = serde_json::to_value(record).unwrap_or(Value::Null);
    if let Err(err) = hub.event(method, data, EventOptions::default()).await {
        tracing::warn!(%err, method, "session lifecycle event failed");
    }
}

/// Register the `session.*` RPC handlers on `hub`.
///
/// Handlers hold the hub weakly so the registry never keeps a dead hub
/// alive through its own handler table.
pub fn register_handlers(
    hub: &Arc<MessageHub>,
    registry: Arc<SessionRegistry>,
) -> Result<(), HubError> {
    let weak = Arc::downgrade(hub);

    let reg = Arc::clone(&registry);
    let hub_ref = weak.clone();
    hub.on_request(
        "session.create",
        request_handler(move |ctx: RequestContext| {
            let reg = Arc::clone(&reg);
            let hub_ref = hub_ref.clone();
            async move {
                let title = ctx.data.get("title").and_then(Value::as_str).unwrap_or("untitled");
                let record = reg.create(title);
                notify(&hub_ref, "session.created", &record).await;
                Ok(json!({ "sessionId": record.session_id }))
            }
        }),
    )?;

    let reg = Arc::clone(&registry);
    hub.on_request(
        "session.list",
        request_handler(move |_ctx| {
            let reg = Arc::clone(&reg);
            async move {
                let sessions = serde_json::to_value(reg.list())
                    .map_err(|err| HubError::new(ErrorCode::Internal, err.to_string()))?;
                Ok(json!({ "sessions": sessions }))
            }
        }),
    )?;

    let reg = Arc::clone(&registry);
    hub.on_request(
        "session.get",
        request_handler(move |ctx: RequestContext| {
            let reg = Arc::clone(&reg);
            async move {
                let session_id = session_id_param(&ctx)?;
                let record = reg.get(&session_id).ok_or_else(|| not_found(&session_id))?;
                serde_json::to_value(&record)
                    .map_err(|err| HubError::new(ErrorCode::Internal, err.to_string()))
            }
        }),
    )?;

    let reg = Arc::clone(&registry);
    let hub_ref = weak.clone();
    hub.on_request(
        "session.update",
        request_handler(move |ctx: RequestContext| {
            let reg = Arc::clone(&reg);
            let hub_ref = hub_ref.clone();
            async move {
                let session_id = session_id_param(&ctx)?;
                let title = ctx
                    .data
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| HubError::new(ErrorCode::InvalidParams, "missing title"))?;
                let record =
                    reg.rename(&session_id, title).ok_or_else(|| not_found(&session_id))?;
                notify(&hub_ref, "session.updated", &record).await;
                serde_json::to_value(&record)
                    .map_err(|err| HubError::new(ErrorCode::Internal, err.to_string()))
            }
        }),
    )?;

    let reg = registry;
    let hub_ref = weak;
    hub.on_request(
        "session.delete",
        request_handler(move |ctx: RequestContext| {
            let reg = Arc::clone(&reg);
            let hub_ref = hub_ref.clone();
            async move {
                let session_id = session_id_param(&ctx)?;
                let record = reg.delete(&session_id).ok_or_else(|| not_found(&session_id))?;
                notify(&hub_ref, "session.deleted", &record).await;
                Ok(json!({ "deleted": true, "sessionId": record.session_id }))
            }
        }),
    )?;

    Ok(())
}

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;
