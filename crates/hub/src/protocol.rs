// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire message schema, constructors, and validation.
//!
//! Every transport boundary decodes through [`HubMessage::from_wire`], so
//! dispatch code downstream may assume well-formed messages. The wire format
//! is one JSON object per message with camelCase field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorCode, HubError};

/// Pinned protocol version stamped on every outgoing message.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Reserved session id carrying system-wide scope.
pub const GLOBAL_SESSION: &str = "global";

/// Conventional method name for PING/PONG liveness probes.
pub const HEARTBEAT_METHOD: &str = "heartbeat";

/// Message kind tag. The wire form is the SCREAMING_SNAKE variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Call,
    Result,
    Error,
    Event,
    Subscribe,
    Unsubscribe,
    Subscribed,
    Unsubscribed,
    Ping,
    Pong,
}

impl MessageType {
    /// Whether this type is a response correlated by `requestId`.
    pub fn requires_request_id(self) -> bool {
        matches!(
            self,
            Self::Result | Self::Error | Self::Subscribed | Self::Unsubscribed | Self::Pong
        )
    }
}

/// The single wire entity exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub session_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Internal routing key stamped by server-side transports after
    /// deserialization. Never serialized onto the wire.
    #[serde(skip)]
    pub client_id: Option<String>,
}

fn base(msg_type: MessageType, method: impl Into<String>, session_id: impl Into<String>) -> HubMessage {
    HubMessage {
        id: Uuid::new_v4().to_string(),
        msg_type,
        session_id: session_id.into(),
        method: method.into(),
        data: None,
        request_id: None,
        error: None,
        error_code: None,
        timestamp: now_rfc3339(),
        version: Some(PROTOCOL_VERSION.to_owned()),
        sequence: None,
        client_id: None,
    }
}

/// RFC 3339 instant with millisecond precision.
fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl HubMessage {
    pub fn call(method: impl Into<String>, session_id: impl Into<String>, data: Option<Value>) -> Self {
        let mut msg = base(MessageType::Call, method, session_id);
        msg.data = data;
        msg
    }

    pub fn result(
        method: impl Into<String>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        let mut msg = base(MessageType::Result, method, session_id);
        msg.request_id = Some(request_id.into());
        msg.data = data;
        msg
    }

    pub fn error(
        method: impl Into<String>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        error: impl Into<String>,
        code: Option<ErrorCode>,
    ) -> Self {
        let mut msg = base(MessageType::Error, method, session_id);
        msg.request_id = Some(request_id.into());
        msg.error = Some(error.into());
        msg.error_code = code.map(|c| c.as_str().to_owned());
        msg
    }

    pub fn event(method: impl Into<String>, session_id: impl Into<String>, data: Option<Value>) -> Self {
        let mut msg = base(MessageType::Event, method, session_id);
        msg.data = data;
        msg
    }

    pub fn subscribe(method: impl Into<String>, session_id: impl Into<String>) -> Self {
        base(MessageType::Subscribe, method, session_id)
    }

    pub fn unsubscribe(method: impl Into<String>, session_id: impl Into<String>) -> Self {
        base(MessageType::Unsubscribe, method, session_id)
    }

    pub fn subscribed(
        method: impl Into<String>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let mut msg = base(MessageType::Subscribed, method, session_id);
        msg.request_id = Some(request_id.into());
        msg
    }

    pub fn unsubscribed(
        method: impl Into<String>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let mut msg = base(MessageType::Unsubscribed, method, session_id);
        msg.request_id = Some(request_id.into());
        msg
    }

    pub fn ping(session_id: impl Into<String>) -> Self {
        base(MessageType::Ping, HEARTBEAT_METHOD, session_id)
    }

    pub fn pong(session_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        let mut msg = base(MessageType::Pong, HEARTBEAT_METHOD, session_id);
        msg.request_id = Some(request_id.into());
        msg
    }

    /// Replace the generated id (tests and deliberate re-emission).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a payload after construction.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Semantic validation on top of the structural checks serde performs.
    ///
    /// Version mismatches are logged and accepted; everything else is a
    /// hard failure with [`ErrorCode::InvalidMessage`] or
    /// [`ErrorCode::InvalidMethod`].
    pub fn validate(&self) -> Result<(), HubError> {
        if self.id.is_empty() {
            return Err(HubError::new(ErrorCode::InvalidMessage, "empty message id"));
        }
        if !validate_session_id(&self.session_id) {
            return Err(HubError::new(
                ErrorCode::InvalidMessage,
                format!("invalid session id: {:?}", self.session_id),
            ));
        }
        // PING/PONG waive the method-format rule.
        let heartbeat = matches!(self.msg_type, MessageType::Ping | MessageType::Pong);
        if !heartbeat && !validate_method(&self.method) {
            return Err(HubError::invalid_method(&self.method));
        }
        if self.msg_type.requires_request_id() && self.request_id.as_deref().is_none_or(str::is_empty)
        {
            return Err(HubError::new(
                ErrorCode::InvalidMessage,
                format!("{:?} message without requestId", self.msg_type),
            ));
        }
        if self.msg_type == MessageType::Error && self.error.as_deref().is_none_or(str::is_empty) {
            return Err(HubError::new(ErrorCode::InvalidMessage, "ERROR message without error text"));
        }
        if let Some(ref version) = self.version {
            if version != PROTOCOL_VERSION {
                tracing::warn!(
                    code = ErrorCode::ProtocolVersionMismatch.as_str(),
                    theirs = %version,
                    ours = PROTOCOL_VERSION,
                    method = %self.method,
                    "protocol version mismatch, accepting message"
                );
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Parse and validate one wire frame.
    pub fn from_wire(text: &str) -> Result<Self, HubError> {
        let msg: Self = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Serialize for the wire. `clientId` is skipped by construction.
    pub fn to_wire(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The parsed error code of an ERROR message, if any.
    pub fn parsed_error_code(&self) -> Option<ErrorCode> {
        self.error_code.as_deref().map(ErrorCode::parse)
    }
}

/// Method naming rule: `domain.action[.qualifier]`. Alphanumeric plus
/// `.`, `_`, `-`; at least one dot; no leading/trailing dot; no colon.
pub fn validate_method(method: &str) -> bool {
    if method.is_empty() || method.starts_with('.') || method.ends_with('.') {
        return false;
    }
    if !method.contains('.') {
        return false;
    }
    method.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Session ids are non-empty and colon-free (disjoint from method syntax).
pub fn validate_session_id(session_id: &str) -> bool {
    !session_id.is_empty() && !session_id.contains(':')
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
