use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kt_bridge::http_api::{api_router, ApiState};
use kt_core::cache::{Reflector, ResourceCache};
use kt_core::config::{Config, LossPolicy};
use kt_core::resolve::PodResolver;
use kt_core::shutdown::ShutdownSignal;
use kt_core::types::Pod;
use kt_election::{LeaderCallbacks, LeaderElectionConfig, LeaderElector, RunOutcome};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, WatchFactory};

/// The lease was lost and the loss policy says to stop the process.
#[derive(Debug, thiserror::Error)]
#[error("leadership lost")]
pub struct LeadershipLost;

/// Runs the HTTP server and, gated by leader election, the pod cache
/// reflector. Stops when the shutdown signal fires.
pub struct Daemon {
    config: Arc<Config>,
    backend: Backend,
    cache: ResourceCache<Pod>,
    identity: String,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(config: Config, backend: Backend) -> Self {
        let identity = config
            .election
            .identity
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            config: Arc::new(config),
            backend,
            cache: ResourceCache::new(),
            identity,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn cache(&self) -> &ResourceCache<Pod> {
        &self.cache
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.server.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> Result<()> {
        let resolver = PodResolver::new(self.cache.clone(), self.backend.authority.clone());
        let state = Arc::new(ApiState::new(
            &self.config,
            resolver,
            self.backend.exec.clone(),
            self.backend.logs.clone(),
        ));
        let router = api_router(state);

        let local_addr = listener.local_addr()?;
        let server_shutdown = self.shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.triggered().await })
                .await
        });
        info!(addr = %local_addr, "HTTP server listening");

        if let Err(e) = self.run_gated().await {
            self.shutdown.trigger();
            return Err(e);
        }
        // The cache sync may finish on its own; keep serving until asked to stop.
        self.shutdown.triggered().await;

        server
            .await
            .context("HTTP server task panicked")?
            .context("HTTP server failed")?;
        info!("daemon stopped");
        Ok(())
    }

    /// Keep the pod cache in sync while this process holds the lease.
    async fn run_gated(&self) -> Result<()> {
        let election = &self.config.election;
        if !election.enabled {
            info!("leader election disabled, syncing pod cache unconditionally");
            Reflector::new(self.cache.clone())
                .run((self.backend.watch)(), self.shutdown.clone())
                .await;
            return Ok(());
        }

        let elector = LeaderElector::new(
            LeaderElectionConfig::from_config(election, self.identity.clone()),
            self.backend.leases.clone(),
        )?;
        let callbacks: Arc<dyn LeaderCallbacks> = Arc::new(CacheSync {
            cache: self.cache.clone(),
            watch: self.backend.watch.clone(),
        });

        loop {
            match elector.run(callbacks.clone(), self.shutdown.clone()).await? {
                RunOutcome::Lost => match election.on_loss {
                    LossPolicy::Exit => {
                        error!(identity = %self.identity, "leadership lost, exiting");
                        return Err(LeadershipLost.into());
                    }
                    LossPolicy::Demote => {
                        warn!(identity = %self.identity, "leadership lost, contending again");
                    }
                },
                RunOutcome::NotAcquired | RunOutcome::Released => return Ok(()),
            }
        }
    }
}

/// Leader-gated work: run the reflector for the length of the term.
struct CacheSync {
    cache: ResourceCache<Pod>,
    watch: WatchFactory,
}

#[async_trait]
impl LeaderCallbacks for CacheSync {
    async fn on_started_leading(&self, term: ShutdownSignal) {
        info!("became leader, syncing pod cache");
        Reflector::new(self.cache.clone())
            .run((self.watch)(), term)
            .await;
    }

    async fn on_stopped_leading(&self) {
        info!("stopped leading, pod cache no longer synced");
    }

    fn on_new_leader(&self, identity: &str) {
        info!(leader = identity, "observed new leader");
    }
}
