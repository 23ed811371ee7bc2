//! HTTP and WebSocket surface of kubeterm.
//!
//! - [`http_api`]: the axum router, shared state, static pages and probes
//! - [`terminal_ws`]: `/ws/{namespace}/{pod}/{container}/webshell`
//! - [`logs_ws`]: `/ws/{namespace}/{pod}/{container}/logs`
//! - [`ws_connection`]: adapts an axum `WebSocket` to the session traits

pub mod api_error;
pub mod http_api;
pub mod logs_ws;
pub mod terminal_ws;
pub mod ws_connection;
