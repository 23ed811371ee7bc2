//! Core types shared by the kubeterm crates.
//!
//! - [`config`]: the immutable startup configuration
//! - [`types`]: object keys and the slice of the Pod schema we read
//! - [`cache`]: the watch-populated resource cache and its reflector
//! - [`resolve`]: cache-first pod resolution with authoritative fallback
//! - [`shutdown`]: fire-once cancellation signal

pub mod cache;
pub mod config;
pub mod resolve;
pub mod shutdown;
pub mod types;
