//! A small Kubernetes API client covering what kubeterm needs:
//!
//! - [`pods`]: pod get (the authoritative lookup) and list+watch (the cache
//!   feed)
//! - [`lease`]: `coordination.k8s.io/v1` Lease records for leader election
//! - [`exec`]: the `exec` subresource over WebSocket (`v4.channel.k8s.io`)
//! - [`logs`]: the `log` subresource as a byte stream

pub mod client;
pub mod exec;
pub mod lease;
pub mod logs;
pub mod pods;

pub use client::{KubeClient, KubeError, Status};
pub use exec::KubeExec;
pub use lease::KubeLeaseStore;
pub use logs::KubeLogs;
pub use pods::{KubePodWatcher, KubePods};
