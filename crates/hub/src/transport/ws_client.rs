// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket client transport: one JSON text frame per message,
//! auto-reconnect with jittered exponential backoff, periodic heartbeat
//! PINGs on the `global` session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;
use crate::protocol::{HubMessage, GLOBAL_SESSION};
use crate::transport::{
    BoxFuture, CallbackId, ConnectionCallback, MessageCallback, Transport, TransportShared,
    TransportState,
};

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Base delay; attempt n waits `base · 2^(n-1)` ± 30 % jitter,
    /// floored at 100 ms.
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Jittered exponential backoff for reconnect attempt `n` (1-based).
fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exp_ms = (base.as_millis() as u64).saturating_mul(1u64 << shift) as f64;
    let jitter = rand::rng().random_range(0.7..=1.3);
    Duration::from_millis((exp_ms * jitter).max(100.0) as u64)
}

pub struct WsClientTransport {
    shared: Arc<TransportShared>,
    config: WsClientConfig,
    started: AtomicBool,
    cancel: CancellationToken,
    outbound: Mutex<Option<mpsc::UnboundedSender<HubMessage>>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsClientTransport {
    pub fn new(config: WsClientConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(TransportShared::new("ws-client")),
            config,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            outbound: Mutex::new(None),
            run_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WsClientConfig {
        &self.config
    }
}

impl Transport for WsClientTransport {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.started.load(Ordering::Acquire) {
                return Ok(());
            }
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            *self.outbound.lock() = Some(outbound_tx);

            let task = tokio::spawn(run_loop(
                Arc::clone(&self.shared),
                self.config.clone(),
                outbound_rx,
                self.cancel.clone(),
                ready_tx,
            ));
            *self.run_task.lock() = Some(task);

            match ready_rx.await {
                Ok(Ok(())) => {
                    self.started.store(true, Ordering::Release);
                    Ok(())
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(HubError::transport("ws connect loop ended unexpectedly")),
            }
        })
    }

    fn send(&self, msg: HubMessage) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if !self.started.load(Ordering::Acquire) {
                return Err(HubError::not_connected(self.name()));
            }
            if self.shared.state() != TransportState::Connected {
                return Err(HubError::transport("websocket is not connected"));
            }
            let sender = self.outbound.lock().clone();
            match sender {
                Some(sender) => sender
                    .send(msg)
                    .map_err(|_| HubError::transport("ws write loop gone")),
                None => Err(HubError::transport("transport closed")),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            self.cancel.cancel();
            self.outbound.lock().take();
            let task = self.run_task.lock().take();
            if let Some(task) = task {
                // The run loop notices the cancellation and sends a Close
                // frame; give it a moment, then drop it.
                let _ = tokio::time::timeout(Duration::from_millis(250), task).await;
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

async fn run_loop(
    shared: Arc<TransportShared>,
    config: WsClientConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<HubMessage>,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<(), HubError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        shared.set_state(TransportState::Connecting, None);

        match tokio_tungstenite::connect_async(&config.url).await {
            Ok((stream, _)) => {
                attempt = 0;
                tracing::debug!(url = %config.url, "websocket connected");
                shared.set_state(TransportState::Connected, None);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }

                let (mut write, mut read) = stream.split();
                // First heartbeat one interval from now, not immediately.
                let mut heartbeat = tokio::time::interval_at(
                    tokio::time::Instant::now() + config.ping_interval,
                    config.ping_interval,
                );

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }

                        _ = heartbeat.tick() => {
                            let ping = HubMessage::ping(GLOBAL_SESSION);
                            let text = match ping.to_wire() {
                                Ok(text) => text,
                                Err(err) => {
                                    tracing::warn!(%err, "heartbeat serialization failed");
                                    continue;
                                }
                            };
                            if write.send(Message::Text(text.into())).await.is_err() {
                                tracing::debug!("heartbeat send failed, reconnecting");
                                break;
                            }
                        }

                        msg = outbound_rx.recv() => {
                            let Some(msg) = msg else { return };
                            let text = match msg.to_wire() {
                                Ok(text) => text,
                                Err(err) => {
                                    tracing::warn!(%err, "outbound serialization failed, dropping");
                                    continue;
                                }
                            };
                            if write.send(Message::Text(text.into())).await.is_err() {
                                tracing::debug!("websocket write failed, reconnecting");
                                break;
                            }
                        }

                        frame = read.next() => {
                            match frame {
                                Some(Ok(Message::Text(text))) => {
                                    match HubMessage::from_wire(&text) {
                                        Ok(msg) => shared.emit(msg),
                                        Err(err) => {
                                            tracing::warn!(%err, "dropping invalid ws frame");
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    tracing::debug!("websocket closed by server");
                                    break;
                                }
                                Some(Err(err)) => {
                                    tracing::debug!(%err, "websocket read error");
                                    break;
                                }
                                _ => {} // ping/pong/binary frames ignored
                            }
                        }
                    }
                }

                shared.set_state(
                    TransportState::Disconnected,
                    Some("websocket connection lost".to_owned()),
                );
            }
            Err(err) => {
                tracing::debug!(url = %config.url, %err, "websocket connect failed");
            }
        }

        if !config.auto_reconnect {
            shared.set_state(TransportState::Disconnected, None);
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(HubError::transport("websocket connect failed")));
            }
            return;
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            shared.set_state(
                TransportState::Error,
                Some(format!("reconnect attempts exhausted ({attempt})")),
            );
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(HubError::transport(format!(
                    "websocket unreachable after {} attempts",
                    config.max_reconnect_attempts
                ))));
            }
            return;
        }

        let delay = reconnect_delay(config.reconnect_delay, attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "ws_client_tests.rs"]
mod tests;
