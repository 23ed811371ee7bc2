//! The terminal session bridge.
//!
//! A [`TerminalSession`] sits between one client connection and an exec
//! transport. The transport drives three loops against it concurrently:
//!
//! - a stdin pump calling [`TerminalSession::read_frame`],
//! - an output pump calling [`TerminalSession::write_frame`],
//! - a size pump calling [`TerminalSession::next_size`].
//!
//! `resize` frames travel from the read path to the size path through a
//! zero-capacity rendezvous channel: the read path does not pick up the next
//! frame until the size pump has taken the new size, so resize events are
//! never dropped, duplicated or reordered relative to stdin.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use kt_core::shutdown::ShutdownSignal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{Message, ProtocolError, TerminalSize, END_OF_TRANSMISSION};

// ---------------------------------------------------------------------------
// Connection halves
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("connection I/O error: {0}")]
    Io(String),
}

/// Receiving half of a client connection.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next text frame; `Ok(None)` when the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<String>, ConnectionError>;
}

/// Sending half of a client connection.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError>;
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] ConnectionError),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Result of reading one inbound frame.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes for the remote stdin. Empty for frames consumed internally
    /// (`resize`, `ping`).
    Data(Vec<u8>),
    /// The input side is over. `cause` is `None` for a clean close by the peer.
    End { cause: Option<SessionError> },
}

impl ReadOutcome {
    /// The bytes to hand to the transport: the payload, or the end-of-
    /// transmission sentinel.
    pub fn bytes(&self) -> &[u8] {
        const SENTINEL: &[u8] = &[END_OF_TRANSMISSION];
        match self {
            ReadOutcome::Data(data) => data,
            ReadOutcome::End { .. } => SENTINEL,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, ReadOutcome::End { .. })
    }

    pub fn error(&self) -> Option<&SessionError> {
        match self {
            ReadOutcome::End { cause } => cause.as_ref(),
            ReadOutcome::Data(_) => None,
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

// ---------------------------------------------------------------------------
// TerminalSession
// ---------------------------------------------------------------------------

pub struct TerminalSession {
    id: Uuid,
    reader: Mutex<Box<dyn FrameReader>>,
    writer: Mutex<SessionWriter>,
    resize_tx: flume::Sender<TerminalSize>,
    resize_rx: flume::Receiver<TerminalSize>,
    state: AtomicU8,
    terminated: ShutdownSignal,
}

struct SessionWriter {
    inner: Box<dyn FrameWriter>,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last write.
    carry: Vec<u8>,
}

impl TerminalSession {
    pub fn new(reader: impl FrameReader, writer: impl FrameWriter) -> Self {
        let (resize_tx, resize_rx) = flume::bounded(0);
        Self {
            id: Uuid::new_v4(),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(SessionWriter {
                inner: Box::new(writer),
                carry: Vec::new(),
            }),
            resize_tx,
            resize_rx,
            state: AtomicU8::new(OPEN),
            terminated: ShutdownSignal::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Resolves once the session has left `Open`.
    pub async fn terminated(&self) {
        self.terminated.triggered().await
    }

    /// Read and decode the next inbound frame.
    pub async fn read_frame(&self) -> ReadOutcome {
        if self.terminated.is_triggered() {
            return ReadOutcome::End {
                cause: Some(SessionError::Closed),
            };
        }

        let received = {
            let mut reader = self.reader.lock().await;
            tokio::select! {
                biased;
                _ = self.terminated.triggered() => {
                    return ReadOutcome::End { cause: Some(SessionError::Closed) };
                }
                received = reader.recv() => received,
            }
        };

        let text = match received {
            Ok(Some(text)) => text,
            Ok(None) => {
                info!(session_id = %self.id, "connection closed by client");
                self.begin_closing("client closed the connection");
                return ReadOutcome::End { cause: None };
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "read message failed");
                self.begin_closing("read failed");
                return ReadOutcome::End {
                    cause: Some(e.into()),
                };
            }
        };

        let message = match Message::decode(&text) {
            Ok(message) => message,
            Err(e) => return self.protocol_violation(e),
        };

        match message {
            Message::Stdin { data } => ReadOutcome::Data(data.into_bytes()),
            Message::Resize { rows, cols } => {
                let size = TerminalSize { cols, rows };
                debug!(session_id = %self.id, cols, rows, "terminal resize requested");
                tokio::select! {
                    biased;
                    _ = self.terminated.triggered() => ReadOutcome::End {
                        cause: Some(SessionError::Closed),
                    },
                    sent = self.resize_tx.send_async(size) => match sent {
                        Ok(()) => ReadOutcome::Data(Vec::new()),
                        // Both channel halves live in `self`.
                        Err(_) => ReadOutcome::End { cause: Some(SessionError::Closed) },
                    },
                }
            }
            Message::Ping => ReadOutcome::Data(Vec::new()),
            other => self.protocol_violation(ProtocolError::UnexpectedOp(other.op())),
        }
    }

    fn protocol_violation(&self, error: ProtocolError) -> ReadOutcome {
        warn!(session_id = %self.id, error = %error, "protocol violation, ending session");
        self.begin_closing("protocol violation");
        ReadOutcome::End {
            cause: Some(error.into()),
        }
    }

    /// Send process output to the client as a `stdout` frame.
    ///
    /// Returns the number of input bytes consumed, which is all of them.
    pub async fn write_frame(&self, data: &[u8]) -> Result<usize, SessionError> {
        let mut writer = self.writer.lock().await;
        if self.terminated.is_triggered() {
            return Err(SessionError::Closed);
        }

        let mut pending = std::mem::take(&mut writer.carry);
        pending.extend_from_slice(data);
        let (text, carry) = split_utf8(&pending);
        writer.carry = carry.to_vec();
        if text.is_empty() {
            return Ok(data.len());
        }

        self.send_locked(&mut writer, Message::Stdout { data: text })
            .await?;
        Ok(data.len())
    }

    /// Send an out-of-band notice to the client as a `toast` frame.
    pub async fn notify(&self, text: &str) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        if self.terminated.is_triggered() {
            return Err(SessionError::Closed);
        }
        self.send_locked(
            &mut writer,
            Message::Toast {
                data: text.to_string(),
            },
        )
        .await
    }

    async fn send_locked(
        &self,
        writer: &mut SessionWriter,
        message: Message,
    ) -> Result<(), SessionError> {
        let text = message.encode().map_err(|e| {
            warn!(session_id = %self.id, error = %e, "encode message failed");
            SessionError::Encode(e.to_string())
        })?;
        if let Err(e) = writer.inner.send(text).await {
            warn!(session_id = %self.id, error = %e, "write message failed");
            self.begin_closing("write failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for the next terminal size, or `None` once the session is over.
    ///
    /// A resize that `read_frame` already handed over is returned even if
    /// the session closed in the meantime.
    pub async fn next_size(&self) -> Option<TerminalSize> {
        if let Ok(size) = self.resize_rx.try_recv() {
            return Some(size);
        }
        if self.terminated.is_triggered() {
            return None;
        }
        tokio::select! {
            biased;
            // read_frame stops producing once terminated, so draining here is bounded.
            _ = self.terminated.triggered() => self.resize_rx.try_recv().ok(),
            size = self.resize_rx.recv_async() => size.ok(),
        }
    }

    /// Close the session and release the connection.
    ///
    /// Safe to call more than once and concurrently with any other
    /// operation; only the first call releases the connection.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.begin_closing("close requested");
        if self
            .state
            .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.carry.clear();
        writer.inner.close().await.map_err(|e| {
            debug!(session_id = %self.id, error = %e, "closing connection failed");
            SessionError::Transport(e)
        })
    }

    /// Move `Open -> Closing` and fire the termination signal, once.
    fn begin_closing(&self, reason: &str) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.terminated.trigger();
            debug!(session_id = %self.id, reason, "session closing");
        }
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Split `bytes` into text to send now and an incomplete UTF-8 tail to keep.
///
/// Invalid sequences in the middle are replaced with U+FFFD.
pub fn split_utf8(bytes: &[u8]) -> (String, &[u8]) {
    let cut = match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            // Invalid bytes somewhere; keep only a trailing partial sequence.
            let tail_start = bytes.len().saturating_sub(3);
            (tail_start..bytes.len())
                .find(|&i| {
                    let tail = &bytes[i..];
                    matches!(std::str::from_utf8(tail), Err(e) if e.valid_up_to() == 0 && e.error_len().is_none())
                })
                .unwrap_or(bytes.len())
        }
    };
    let (head, tail) = bytes.split_at(cut);
    (String::from_utf8_lossy(head).into_owned(), tail)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
