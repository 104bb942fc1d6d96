// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NDJSON transport over standard streams.
//!
//! Three modes: `parent` drives a child process's stdin/stdout, `child`
//! uses the process's own standard streams, and `streams` runs over
//! supplied byte streams (duplex pairs in tests). One message per line;
//! the reader tolerates `\r\n`, skips empty lines, and drops lines that
//! fail to parse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use crate::error::{ErrorCode, HubError};
use crate::protocol::HubMessage;
use crate::transport::{
    decode_line, encode_line, BoxFuture, CallbackId, ConnectionCallback, MessageCallback,
    Transport, TransportShared, TransportState,
};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Parent,
    Child,
    Streams,
}

pub struct StdioTransport {
    shared: Arc<TransportShared>,
    mode: StdioMode,
    started: AtomicBool,
    reader_src: Mutex<Option<Reader>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    fn new(mode: StdioMode, name: &str, reader: Reader, writer: Writer) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(TransportShared::new(name)),
            mode,
            started: AtomicBool::new(false),
            reader_src: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader_task: Mutex::new(None),
        })
    }

    /// Drive a spawned child process over its stdin/stdout.
    ///
    /// Takes ownership of both pipes; the child must have been spawned with
    /// `Stdio::piped()` on each.
    pub fn parent(child: &mut tokio::process::Child) -> Result<Arc<Self>, HubError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::new(ErrorCode::TransportError, "child stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::new(ErrorCode::TransportError, "child stdout not piped"))?;
        Ok(Self::new(StdioMode::Parent, "stdio-parent", Box::new(stdout), Box::new(stdin)))
    }

    /// Use this process's own standard streams (worker side).
    pub fn child() -> Arc<Self> {
        Self::new(
            StdioMode::Child,
            "stdio-child",
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        )
    }

    /// Run over supplied byte streams (test pairs).
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<Self> {
        Self::new(StdioMode::Streams, "stdio-streams", Box::new(reader), Box::new(writer))
    }

    pub fn mode(&self) -> StdioMode {
        self.mode
    }
}

impl Transport for StdioTransport {
    fn name(&self) -> &str {
        self.shared.name()
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let Some(reader) = self.reader_src.lock().take() else {
                return Ok(());
            };
            let shared = Arc::clone(&self.shared);
            let task = tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(msg) = decode_line(shared.name(), &line) {
                                shared.emit(msg);
                            }
                        }
                        Ok(None) => {
                            shared.set_state(
                                TransportState::Disconnected,
                                Some("stream closed".to_owned()),
                            );
                            break;
                        }
                        Err(err) => {
                            shared
                                .set_state(TransportState::Error, Some(err.to_string()));
                            break;
                        }
                    }
                }
            });
            *self.reader_task.lock() = Some(task);
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
                return Err(HubError::transport("stdio stream is not connected"));
            }
            let line = encode_line(&msg)?;
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(HubError::transport("stdio writer closed"));
            };
            if let Err(err) = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await
            {
                drop(guard);
                self.shared.set_state(TransportState::Error, Some(err.to_string()));
                return Err(HubError::transport(format!("stdio write failed: {err}")));
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if let Some(task) = self.reader_task.lock().take() {
                task.abort();
            }
            // Dropping the writer closes a child's stdin pipe (parent mode)
            // but never the process's own standard streams (child mode),
            // which tokio only borrows.
            self.writer.lock().await.take();
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
#[path = "stdio_tests.rs"]
mod tests;
