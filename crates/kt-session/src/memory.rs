//! In-memory connection pair.
//!
//! [`memory_connection`] returns the two halves a [`TerminalSession`] needs
//! plus a [`MemoryPeer`] playing the browser. Used by tests and by anything
//! that wants to drive a session without a socket.
//!
//! [`TerminalSession`]: crate::session::TerminalSession

use async_trait::async_trait;

use crate::protocol::Message;
use crate::session::{ConnectionError, FrameReader, FrameWriter};

pub struct MemoryReader {
    rx: flume::Receiver<Result<String, ConnectionError>>,
}

pub struct MemoryWriter {
    tx: Option<flume::Sender<String>>,
}

/// The far end of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<flume::Sender<Result<String, ConnectionError>>>,
    rx: flume::Receiver<String>,
}

pub fn memory_connection() -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (in_tx, in_rx) = flume::unbounded();
    let (out_tx, out_rx) = flume::unbounded();
    (
        MemoryReader { rx: in_rx },
        MemoryWriter { tx: Some(out_tx) },
        MemoryPeer {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        match self.rx.recv_async().await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        let tx = self.tx.as_ref().ok_or(ConnectionError::Closed)?;
        tx.send_async(text)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.tx.take();
        Ok(())
    }
}

impl MemoryPeer {
    /// Send a raw text frame.
    pub fn send_text(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(text.into()));
        }
    }

    /// Send an encoded message.
    pub fn send(&self, message: &Message) {
        if let Ok(text) = message.encode() {
            self.send_text(text);
        }
    }

    /// Make the next read fail as a broken connection would.
    pub fn fail(&self, reason: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(ConnectionError::Io(reason.into())));
        }
    }

    /// Close the sending side cleanly.
    pub fn hang_up(&mut self) {
        self.tx.take();
    }

    /// Next frame written by the session; `None` once it released the
    /// connection and everything was drained.
    pub async fn recv_text(&self) -> Option<String> {
        self.rx.recv_async().await.ok()
    }

    pub async fn recv(&self) -> Option<Message> {
        let text = self.recv_text().await?;
        Message::decode(&text).ok()
    }

    /// Frames written so far, without waiting.
    pub fn drain(&self) -> Vec<String> {
        self.rx.drain().collect()
    }

    /// Whether the session released its sending half.
    pub fn is_released(&self) -> bool {
        self.rx.is_disconnected()
    }
}
