//! Terminal sessions for kubeterm.
//!
//! This crate bridges one browser WebSocket onto the streams of a process
//! running in a container:
//!
//! - [`protocol`]: the JSON frames exchanged with the browser
//! - [`session`]: the per-connection bridge (`read_frame`, `write_frame`,
//!   `next_size`, `notify`, `close`)
//! - [`transport`]: the capability traits an exec transport consumes, and the
//!   shell fallback chain
//! - [`pty_pool`]: a local PTY exec transport for development
//! - [`logs`]: container log streaming
//! - [`memory`]: an in-memory connection pair

pub mod logs;
pub mod memory;
pub mod protocol;
pub mod pty_pool;
pub mod session;
pub mod transport;
