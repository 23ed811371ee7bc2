//! The kubeterm process: command line, backend wiring and the daemon that
//! runs the HTTP server next to the leader-gated pod cache.

pub mod backend;
pub mod cli;
pub mod daemon;
