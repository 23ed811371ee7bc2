use std::sync::Arc;

use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    response::IntoResponse,
};
use kt_core::types::ContainerRef;
use kt_session::session::TerminalSession;
use kt_session::transport::{exec_with_fallback, ExecError, StreamIo};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::http_api::ApiState;
use crate::ws_connection;

/// GET /ws/{namespace}/{pod}/{container}/webshell
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let target = ContainerRef::new(namespace, pod, container);
    ws.on_upgrade(move |socket| handle_terminal_ws(socket, state, target))
}

async fn handle_terminal_ws(socket: WebSocket, state: Arc<ApiState>, target: ContainerRef) {
    let (reader, writer) = ws_connection::split(socket);
    let session = Arc::new(TerminalSession::new(reader, writer));
    let span = info_span!(
        "terminal_session",
        session_id = %session.id(),
        namespace = %target.namespace,
        pod = %target.pod,
        container = %target.container,
    );
    run_session(&state, &session, &target).instrument(span).await;
}

/// Resolve the target, run a shell in it and close the session.
///
/// Failures the user should see are sent as a `toast` before closing.
pub async fn run_session(state: &ApiState, session: &Arc<TerminalSession>, target: &ContainerRef) {
    info!("terminal session opened");
    match state.resolver.resolve_container(target).await {
        Ok(resolved) => {
            debug!(source = ?resolved.source, "container resolved");
            let io = StreamIo::from_session(session);
            match exec_with_fallback(state.exec.as_ref(), target, &state.shells, &io).await {
                Ok(shell) => info!(%shell, "shell exited"),
                Err(ExecError::NonZeroExit { code }) => info!(code, "shell exited with non-zero status"),
                Err(e) => {
                    warn!(error = %e, "exec failed");
                    toast(session, &format!("Failed to start a shell in {target}: {e}")).await;
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot resolve container");
            toast(session, &e.to_string()).await;
        }
    }
    if let Err(e) = session.close().await {
        debug!(error = %e, "session close reported an error");
    }
    info!("terminal session closed");
}

async fn toast(session: &TerminalSession, text: &str) {
    if let Err(e) = session.notify(text).await {
        debug!(error = %e, "toast not delivered");
    }
}
