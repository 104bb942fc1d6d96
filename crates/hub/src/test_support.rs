// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: mock connections, a recording transport,
//! and small assertion helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::HubError;
use crate::protocol::HubMessage;
use crate::router::ClientConnection;
use crate::transport::{
    BoxFuture, CallbackId, ConnectionCallback, MessageCallback, Transport, TransportShared,
    TransportState,
};

/// A [`ClientConnection`] that records everything sent to it.
pub struct MockConnection {
    id: String,
    open: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockConnection {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    /// Raw wire frames received so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Parsed messages received so far.
    pub fn sent_messages(&self) -> Vec<HubMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| HubMessage::from_wire(text).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl ClientConnection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, text: &str) -> Result<(), HubError> {
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(HubError::transport("mock send failure"));
        }
        self.sent.lock().push(text.to_owned());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// A [`Transport`] that records outbound messages and lets tests inject
/// inbound ones or force state transitions.
pub struct RecordingTransport {
    shared: Arc<TransportShared>,
    sent: Mutex<Vec<HubMessage>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(TransportShared::new("recording")),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Deliver one message as if it arrived from the wire.
    pub fn inject(&self, msg: HubMessage) {
        self.shared.emit(msg);
    }

    /// Force a state transition (e.g. simulate a disconnect).
    pub fn transition(&self, state: TransportState, error: Option<String>) {
        self.shared.set_state(state, error);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<HubMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.shared.set_state(TransportState::Connected, None);
            Ok(())
        })
    }

    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.shared.state() != TransportState::Connected {
                return Err(HubError::not_connected(self.name()));
            }
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(HubError::transport("recording send failure"));
            }
            self.sent.lock().push(msg);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
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

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            shared: Arc::new(TransportShared::new("recording")),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }
}

/// Poll `check` every 10 ms until it returns true or `timeout` elapses.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
