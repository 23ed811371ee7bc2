//! Logging and request tracing for kubeterm.
//!
//! - **Logging**: `tracing-subscriber` setup from the `[logging]` config
//!   section, text or JSON, to stdout, stderr or a file
//! - **Tracing**: axum middleware that tags every request with an
//!   `X-Request-Id` and runs it inside a span

pub mod logging;
pub mod tracing_setup;
