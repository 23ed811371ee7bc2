use std::path::PathBuf;
use std::sync::Arc;

use axum::{middleware as axum_middleware, routing::get, Router};
use kt_core::config::Config;
use kt_core::resolve::PodResolver;
use kt_session::logs::LogSource;
use kt_session::transport::ExecTransport;
use kt_telemetry::tracing_setup::request_id_middleware;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::{logs_ws, terminal_ws};

/// Shared state for all HTTP/WS handlers.
pub struct ApiState {
    pub resolver: PodResolver,
    pub exec: Arc<dyn ExecTransport>,
    pub logs: Arc<dyn LogSource>,
    /// Shells tried in order for a terminal session.
    pub shells: Vec<String>,
    /// Directory holding `terminal.html`, `logs.html` and their assets.
    pub static_dir: PathBuf,
}

impl ApiState {
    pub fn new(
        config: &Config,
        resolver: PodResolver,
        exec: Arc<dyn ExecTransport>,
        logs: Arc<dyn LogSource>,
    ) -> Self {
        Self {
            resolver,
            exec,
            logs,
            shells: config.terminal.shells.clone(),
            static_dir: config.server.static_dir.clone(),
        }
    }
}

/// Build the router with every page, socket and probe route.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let static_dir = state.static_dir.clone();
    Router::new()
        .route_service("/terminal", ServeFile::new(static_dir.join("terminal.html")))
        .route_service("/logs", ServeFile::new(static_dir.join("logs.html")))
        .nest_service("/static", ServeDir::new(&static_dir))
        .route(
            "/ws/{namespace}/{pod}/{container}/webshell",
            get(terminal_ws::terminal_ws),
        )
        .route(
            "/ws/{namespace}/{pod}/{container}/logs",
            get(logs_ws::logs_ws),
        )
        .route("/-/healthy", get(healthy))
        .route("/-/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .layer(axum_middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn healthy() -> &'static str {
    "ok"
}

async fn ready() -> &'static str {
    "ok"
}
