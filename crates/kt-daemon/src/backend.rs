//! Wiring of the pluggable pieces for the configured backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kt_core::cache::{WatchError, WatchEvent, WatchSource};
use kt_core::config::{BackendKind, Config, LocalConfig};
use kt_core::resolve::{LookupError, PodLookup};
use kt_core::types::{ContainerRef, ObjectKey, Pod};
use kt_election::{InMemoryLeaseStore, LeaseStore};
use kt_kube::{KubeClient, KubeExec, KubeLeaseStore, KubeLogs, KubePodWatcher, KubePods};
use kt_session::logs::{LogError, LogOptions, LogSource, LogStream};
use kt_session::pty_pool::LocalPtyTransport;
use kt_session::transport::ExecTransport;
use tracing::info;

/// Builds a fresh watch source for each leadership term.
pub type WatchFactory = Arc<dyn Fn() -> Box<dyn WatchSource<Pod>> + Send + Sync>;

pub struct Backend {
    pub authority: Arc<dyn PodLookup>,
    pub watch: WatchFactory,
    pub exec: Arc<dyn ExecTransport>,
    pub logs: Arc<dyn LogSource>,
    pub leases: Arc<dyn LeaseStore>,
}

impl Backend {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.backend.kind {
            BackendKind::Kubernetes => Self::kubernetes(config),
            BackendKind::Local => Ok(Self::local(config)),
        }
    }

    fn kubernetes(config: &Config) -> Result<Self> {
        let client =
            KubeClient::from_config(&config.kubernetes).context("failed to build Kubernetes client")?;
        let lease_namespace = config
            .election
            .lease_namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        info!(
            api_server = %client.base_url(),
            watch_namespace = ?config.kubernetes.watch_namespace,
            %lease_namespace,
            "using kubernetes backend"
        );

        let watch_client = client.clone();
        let watch_namespace = config.kubernetes.watch_namespace.clone();
        Ok(Self {
            authority: Arc::new(KubePods::new(client.clone())),
            watch: Arc::new(move || -> Box<dyn WatchSource<Pod>> {
                Box::new(KubePodWatcher::new(watch_client.clone(), watch_namespace.clone()))
            }),
            exec: Arc::new(KubeExec::new(client.clone(), config.terminal.exec_eof_grace())),
            logs: Arc::new(KubeLogs::new(client.clone())),
            leases: Arc::new(KubeLeaseStore::new(
                client,
                lease_namespace,
                config.election.lease_name.clone(),
            )),
        })
    }

    /// Pods from `[local]`, shells in a local PTY, an in-process lease.
    pub fn local(config: &Config) -> Self {
        let inventory = LocalInventory::from_config(&config.local);
        info!(pods = inventory.pods.len(), "using local backend");

        let mut exec = LocalPtyTransport::new(config.local.max_ptys, config.terminal.exec_eof_grace());
        for pod in &config.local.pods {
            if let Some(dir) = &pod.workdir {
                exec = exec.with_workdir(ObjectKey::new(&pod.namespace, &pod.name), dir.clone());
            }
        }

        let watch_inventory = inventory.clone();
        Self {
            authority: Arc::new(inventory),
            watch: Arc::new(move || -> Box<dyn WatchSource<Pod>> { Box::new(watch_inventory.watch()) }),
            exec: Arc::new(exec),
            logs: Arc::new(UnsupportedLogs),
            leases: Arc::new(InMemoryLeaseStore::new(config.election.lease_name.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Local backend
// ---------------------------------------------------------------------------

/// The fixed set of pods declared in the config file.
#[derive(Debug, Clone)]
pub struct LocalInventory {
    pods: Arc<Vec<Pod>>,
}

impl LocalInventory {
    pub fn from_config(config: &LocalConfig) -> Self {
        let pods = config
            .pods
            .iter()
            .map(|p| Pod::with_containers(&p.namespace, &p.name, p.containers.iter().cloned()))
            .collect();
        Self {
            pods: Arc::new(pods),
        }
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    /// A watch that lists the inventory once; it never changes afterwards.
    pub fn watch(&self) -> LocalWatch {
        LocalWatch {
            pending: Some(self.pods.as_ref().clone()),
        }
    }
}

#[async_trait]
impl PodLookup for LocalInventory {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, LookupError> {
        self.pods
            .iter()
            .find(|p| p.metadata.namespace == key.namespace && p.metadata.name == key.name)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(key.clone()))
    }
}

pub struct LocalWatch {
    pending: Option<Vec<Pod>>,
}

#[async_trait]
impl WatchSource<Pod> for LocalWatch {
    async fn next_event(&mut self) -> Result<Option<WatchEvent<Pod>>, WatchError> {
        Ok(self.pending.take().map(WatchEvent::Restarted))
    }
}

/// Log source for backends without container logs.
pub struct UnsupportedLogs;

#[async_trait]
impl LogSource for UnsupportedLogs {
    async fn stream_logs(
        &self,
        target: &ContainerRef,
        _options: &LogOptions,
    ) -> Result<LogStream, LogError> {
        Err(LogError::Unsupported(format!(
            "the local backend has no logs for {target}"
        )))
    }
}
