//! `exec` over WebSocket, `v4.channel.k8s.io`.
//!
//! Every binary frame starts with a channel byte:
//!
//! ```text
//! 0  stdin   client -> server
//! 1  stdout  server -> client
//! 2  stderr  server -> client
//! 3  status  server -> client, one meta/v1 Status when the process ends
//! 4  resize  client -> server, {"Width": cols, "Height": rows}
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use kt_core::types::ContainerRef;
use kt_session::protocol::TerminalSize;
use kt_session::transport::{ExecError, ExecTransport, StreamIo};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::{KubeClient, KubeError, Status};

pub const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";

const STDIN: u8 = 0;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;
const STATUS: u8 = 3;
const RESIZE: u8 = 4;

type ExecSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ExecSink = Arc<Mutex<SplitSink<ExecSocket, Message>>>;

#[derive(Serialize)]
struct ResizeFrame {
    #[serde(rename = "Width")]
    width: u16,
    #[serde(rename = "Height")]
    height: u16,
}

/// Exec transport against the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeExec {
    client: KubeClient,
    /// How long to keep the remote process after stdin ended before hanging up.
    eof_grace: Duration,
}

impl KubeExec {
    pub fn new(client: KubeClient, eof_grace: Duration) -> Self {
        Self { client, eof_grace }
    }

    fn exec_path(target: &ContainerRef, command: &[String]) -> String {
        let mut path = format!(
            "/api/v1/namespaces/{}/pods/{}/exec?container={}&stdin=true&stdout=true&stderr=true&tty=true",
            urlencoding::encode(&target.namespace),
            urlencoding::encode(&target.pod),
            urlencoding::encode(&target.container)
        );
        for arg in command {
            path.push_str("&command=");
            path.push_str(&urlencoding::encode(arg));
        }
        path
    }

    async fn connect(&self, target: &ContainerRef, command: &[String]) -> Result<ExecSocket, KubeError> {
        let url = self.client.websocket_url(&Self::exec_path(target, command));
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static(EXEC_PROTOCOL));
        if let Some(token) = self.client.bearer_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| KubeError::Config(format!("invalid bearer token: {e}")))?;
            headers.insert("Authorization", value);
        }

        let connector = self
            .client
            .tls_connector()?
            .map(tokio_tungstenite::Connector::NativeTls);
        let (socket, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await?;
        Ok(socket)
    }
}

fn frame(channel: u8, payload: &[u8]) -> Message {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(channel);
    data.extend_from_slice(payload);
    Message::Binary(data.into())
}

async fn send(sink: &ExecSink, message: Message) -> Result<(), ExecError> {
    sink.lock()
        .await
        .send(message)
        .await
        .map_err(|e| ExecError::Transport(e.to_string()))
}

fn resize_frame(size: TerminalSize) -> Option<Message> {
    let body = serde_json::to_vec(&ResizeFrame {
        width: size.cols,
        height: size.rows,
    })
    .ok()?;
    Some(frame(RESIZE, &body))
}

/// Map the final status frame to the outcome of the exec.
fn exec_result(status: &Status, command: &[String]) -> Result<(), ExecError> {
    if status.is_success() {
        return Ok(());
    }
    match status.exit_code() {
        Some(code) => Err(ExecError::NonZeroExit { code }),
        None => Err(ExecError::start_failed(command, status.message.clone())),
    }
}

#[async_trait]
impl ExecTransport for KubeExec {
    async fn stream(
        &self,
        target: &ContainerRef,
        command: &[String],
        io: &StreamIo,
    ) -> Result<(), ExecError> {
        let socket = self
            .connect(target, command)
            .await
            .map_err(|e| ExecError::Transport(format!("exec into {target}: {e}")))?;
        info!(%target, ?command, "exec stream established");

        let (sink, mut source) = socket.split();
        let sink: ExecSink = Arc::new(Mutex::new(sink));

        let output = async {
            while let Some(message) = source.next().await {
                let message = message.map_err(|e| ExecError::Transport(e.to_string()))?;
                let data = match message {
                    Message::Binary(data) => data,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Some((&channel, payload)) = data.split_first() else {
                    continue;
                };
                match channel {
                    STDOUT | STDERR => {
                        io.stdout.write_stdout(payload).await?;
                    }
                    STATUS => {
                        let status: Status = serde_json::from_slice(payload)
                            .map_err(|e| ExecError::Transport(format!("bad status frame: {e}")))?;
                        debug!(%target, ?status, "exec status received");
                        return exec_result(&status, command);
                    }
                    other => debug!(channel = other, "ignoring frame on unknown channel"),
                }
            }
            Ok(())
        };

        let input = async {
            loop {
                let outcome = io.stdin.read_stdin().await;
                let bytes = outcome.bytes();
                if !bytes.is_empty() {
                    if let Err(e) = send(&sink, frame(STDIN, bytes)).await {
                        debug!(%target, error = %e, "stdin forwarding stopped");
                        break;
                    }
                }
                if outcome.is_end() {
                    break;
                }
            }
            tokio::time::sleep(self.eof_grace).await;
        };

        let sizes = async {
            while let Some(size) = io.sizes.next_size().await {
                let Some(message) = resize_frame(size) else {
                    continue;
                };
                if let Err(e) = send(&sink, message).await {
                    warn!(%target, error = %e, "resize forwarding failed");
                    break;
                }
            }
            std::future::pending::<()>().await
        };

        let result = tokio::select! {
            result = output => result,
            _ = input => {
                debug!(%target, "client input ended, closing exec stream");
                Ok(())
            }
            _ = sizes => Ok(()),
        };

        let _ = sink.lock().await.close().await;
        result
    }
}
