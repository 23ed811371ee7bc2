//! [`FrameReader`]/[`FrameWriter`] over an axum `WebSocket`.

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kt_session::session::{ConnectionError, FrameReader, FrameWriter};

pub struct WsReader {
    inner: SplitStream<WebSocket>,
}

pub struct WsWriter {
    inner: SplitSink<WebSocket, Message>,
    closed: bool,
}

/// Split a socket into the two session halves.
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (
        WsReader { inner: stream },
        WsWriter {
            inner: sink,
            closed: false,
        },
    )
}

#[async_trait::async_trait]
impl FrameReader for WsReader {
    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        while let Some(message) = self.inner.next().await {
            match message.map_err(|e| ConnectionError::Io(e.to_string()))? {
                Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                Message::Binary(data) => {
                    return String::from_utf8(data.to_vec())
                        .map(Some)
                        .map_err(|_| ConnectionError::Io("binary frame is not UTF-8".into()));
                }
                Message::Close(_) => return Ok(None),
                // Pongs are answered by axum.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        };
        // The peer may already be gone; closing the sink still releases it.
        let _ = self.inner.send(Message::Close(Some(frame))).await;
        self.inner
            .close()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }
}
