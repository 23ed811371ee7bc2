use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use kt_core::types::ContainerRef;
use kt_session::logs::LogOptions;
use kt_session::session::split_utf8;
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::api_error::ApiError;
use crate::http_api::ApiState;

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Last N lines only; absent or zero means all.
    pub tail: Option<i64>,
}

/// GET /ws/{namespace}/{pod}/{container}/logs?tail=N
///
/// Each log chunk goes out as a raw text frame, not a protocol message.
pub async fn logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(query): Query<LogsQuery>,
) -> Response {
    if matches!(query.tail, Some(n) if n < 0) {
        return ApiError::InvalidQuery {
            name: "tail",
            reason: "must not be negative".into(),
        }
        .into_response();
    }
    let target = ContainerRef::new(namespace, pod, container);
    let options = LogOptions::from_tail(query.tail);
    let span = info_span!(
        "log_stream",
        namespace = %target.namespace,
        pod = %target.pod,
        container = %target.container,
    );
    ws.on_upgrade(move |socket| handle_logs_ws(socket, state, target, options).instrument(span))
        .into_response()
}

async fn handle_logs_ws(socket: WebSocket, state: Arc<ApiState>, target: ContainerRef, options: LogOptions) {
    let (mut sink, mut client) = socket.split();

    let stream = match state.resolver.resolve_container(&target).await {
        Ok(_) => state
            .logs
            .stream_logs(&target, &options)
            .await
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(reason) => {
            warn!(%reason, "cannot stream logs");
            let _ = sink.send(Message::Text(reason.into())).await;
            let _ = sink.close().await;
            return;
        }
    };
    info!(tail = ?options.tail_lines, "log stream started");

    // Bytes of a character split across chunks, held until the rest arrives.
    let mut carry: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    carry.extend_from_slice(&bytes);
                    let (text, rest) = split_utf8(&carry);
                    carry = rest.to_vec();
                    if text.is_empty() {
                        continue;
                    }
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        debug!("client went away");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "log stream failed");
                    let _ = sink.send(Message::Text(e.to_string().into())).await;
                    break;
                }
                None => {
                    debug!("log stream ended");
                    if !carry.is_empty() {
                        let text = String::from_utf8_lossy(&carry).into_owned();
                        let _ = sink.send(Message::Text(text.into())).await;
                    }
                    break;
                }
            },
            incoming = client.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!("client closed the log stream");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sink.close().await;
    info!("log stream closed");
}
