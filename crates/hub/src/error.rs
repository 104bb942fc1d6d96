// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across all transports and the hub surface.
///
/// The wire form (`errorCode` on ERROR messages) is the SCREAMING_SNAKE
/// string from [`ErrorCode::as_str`]; it is stable across protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidMethod,
    ProtocolVersionMismatch,
    MethodNotFound,
    HandlerError,
    Timeout,
    InvalidParams,
    InvalidSession,
    SessionNotFound,
    TransportError,
    NotConnected,
    Internal,
    Unauthorized,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidMethod => "INVALID_METHOD",
            Self::ProtocolVersionMismatch => "PROTOCOL_VERSION_MISMATCH",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InvalidSession => "INVALID_SESSION",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::NotConnected => "NOT_CONNECTED",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Parse a wire `errorCode` tag back into an [`ErrorCode`].
    ///
    /// Unknown tags map to [`ErrorCode::Internal`] so responses from newer
    /// peers still surface as errors rather than being dropped.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "INVALID_MESSAGE" => Self::InvalidMessage,
            "INVALID_METHOD" => Self::InvalidMethod,
            "PROTOCOL_VERSION_MISMATCH" => Self::ProtocolVersionMismatch,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "HANDLER_ERROR" => Self::HandlerError,
            "TIMEOUT" => Self::Timeout,
            "INVALID_PARAMS" => Self::InvalidParams,
            "INVALID_SESSION" => Self::InvalidSession,
            "SESSION_NOT_FOUND" => Self::SessionNotFound,
            "TRANSPORT_ERROR" => Self::TransportError,
            "NOT_CONNECTED" => Self::NotConnected,
            "UNAUTHORIZED" => Self::Unauthorized,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carrier for every fallible hub operation: a stable code plus a
/// human-readable message. RPC rejections expose both to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubError {
    pub code: ErrorCode,
    pub message: String,
}

impl HubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::new(ErrorCode::InvalidMethod, format!("invalid method name: {method:?}"))
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportError, message)
    }

    pub fn not_connected(name: &str) -> Self {
        Self::new(ErrorCode::NotConnected, format!("transport {name} is not connected"))
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HubError {}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::InvalidMessage, err.to_string())
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(ErrorCode::HandlerError, format!("{err:#}"))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
