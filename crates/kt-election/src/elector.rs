use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kt_core::config::ElectionConfig;
use kt_core::shutdown::ShutdownSignal;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::lease::{LeaseError, LeaseRecord, LeaseStore, VersionedLease};

/// Upper bound of the random extra delay added to each contention attempt,
/// as a fraction of the retry period.
const JITTER_FACTOR: f64 = 1.2;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub identity: String,
    /// How long a non-renewed lease stays valid, as seen by other contenders.
    pub lease_duration: Duration,
    /// How long the holder keeps retrying a failed renewal before giving up.
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    /// Clear the holder on voluntary shutdown so others need not wait for
    /// expiry.
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    pub fn from_config(config: &ElectionConfig, identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_duration: config.lease_duration(),
            renew_deadline: config.renew_deadline(),
            retry_period: config.retry_period(),
            release_on_cancel: config.release_on_cancel,
        }
    }

    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.identity.is_empty() {
            return Err(ElectionError::InvalidConfig("identity is empty".into()));
        }
        if self.retry_period.is_zero() {
            return Err(ElectionError::InvalidConfig(
                "retry period must be greater than zero".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionError::InvalidConfig(
                "lease duration must be greater than the renew deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(ElectionError::InvalidConfig(
                "renew deadline must be greater than the retry period".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("invalid leader election config: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Hooks invoked over a leadership term.
#[async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// The gated work. Runs in its own task for the whole term and should
    /// return soon after `term` fires.
    async fn on_started_leading(&self, term: ShutdownSignal);

    /// Called once after a term ended and its work returned.
    async fn on_stopped_leading(&self);

    /// A different holder was observed. Informational only.
    fn on_new_leader(&self, _identity: &str) {}
}

/// How a call to [`LeaderElector::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown arrived before the lease was acquired.
    NotAcquired,
    /// The lease could not be renewed within the renew deadline.
    Lost,
    /// Shutdown ended the term voluntarily.
    Released,
}

// ---------------------------------------------------------------------------
// LeaderElector
// ---------------------------------------------------------------------------

/// Last record seen in the store, and when this process first saw it.
///
/// Expiry of someone else's lease is measured from `observed_at` on the local
/// monotonic clock; the timestamps inside the record come from another
/// machine and are never compared against ours.
struct Observation {
    lease: Option<VersionedLease>,
    observed_at: Instant,
    reported_leader: Option<String>,
}

pub struct LeaderElector {
    config: LeaderElectionConfig,
    store: Arc<dyn LeaseStore>,
    observation: Mutex<Observation>,
    leading: AtomicBool,
}

impl LeaderElector {
    pub fn new(
        config: LeaderElectionConfig,
        store: Arc<dyn LeaseStore>,
    ) -> Result<Self, ElectionError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            observation: Mutex::new(Observation {
                lease: None,
                observed_at: Instant::now(),
                reported_leader: None,
            }),
            leading: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Whether this process currently holds the lease.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Acquire)
    }

    /// Contend for the lease and run one leadership term.
    ///
    /// Returns when `shutdown` fires or the term ends. `on_started_leading`
    /// and `on_stopped_leading` are each called at most once per call.
    pub async fn run(
        &self,
        callbacks: Arc<dyn LeaderCallbacks>,
        shutdown: ShutdownSignal,
    ) -> Result<RunOutcome, ElectionError> {
        let lease = self.store.describe();
        info!(identity = %self.config.identity, %lease, "attempting to acquire leader lease");

        if !self.acquire(callbacks.as_ref(), &shutdown).await {
            return Ok(RunOutcome::NotAcquired);
        }
        self.leading.store(true, Ordering::Release);
        info!(identity = %self.config.identity, %lease, "successfully acquired lease");

        let term = ShutdownSignal::new();
        let work = {
            let callbacks = callbacks.clone();
            let term = term.clone();
            tokio::spawn(async move { callbacks.on_started_leading(term).await })
        };

        let outcome = self.renew(callbacks.as_ref(), &shutdown).await;
        self.leading.store(false, Ordering::Release);
        match outcome {
            RunOutcome::Lost => error!(identity = %self.config.identity, %lease, "leader lease lost"),
            _ => info!(identity = %self.config.identity, %lease, "stepping down"),
        }

        term.trigger();
        if let Err(e) = work.await {
            error!(error = %e, "leader task failed");
        }
        if outcome == RunOutcome::Released && self.config.release_on_cancel {
            self.release().await;
        }
        callbacks.on_stopped_leading().await;
        Ok(outcome)
    }

    /// Retry every (jittered) retry period until acquired or shut down.
    async fn acquire(&self, callbacks: &dyn LeaderCallbacks, shutdown: &ShutdownSignal) -> bool {
        loop {
            if shutdown.is_triggered() {
                return false;
            }
            if self.try_acquire_or_renew(callbacks).await {
                return true;
            }
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return false,
                _ = tokio::time::sleep(self.jittered_retry_period()) => {}
            }
        }
    }

    /// Renew every retry period; a renewal may retry until the renew
    /// deadline before the lease counts as lost.
    async fn renew(&self, callbacks: &dyn LeaderCallbacks, shutdown: &ShutdownSignal) -> RunOutcome {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return RunOutcome::Released,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let attempt = tokio::time::timeout(self.config.renew_deadline, async {
                loop {
                    if self.try_acquire_or_renew(callbacks).await {
                        return;
                    }
                    tokio::time::sleep(self.config.retry_period).await;
                }
            });
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return RunOutcome::Released,
                renewed = attempt => {
                    if renewed.is_err() {
                        warn!(
                            identity = %self.config.identity,
                            deadline = ?self.config.renew_deadline,
                            "failed to renew lease before the deadline"
                        );
                        return RunOutcome::Lost;
                    }
                    debug!(identity = %self.config.identity, "lease renewed");
                }
            }
        }
    }

    /// One acquire-or-renew attempt against the store.
    async fn try_acquire_or_renew(&self, callbacks: &dyn LeaderCallbacks) -> bool {
        let now = Utc::now();
        let identity = self.config.identity.as_str();
        let mut desired = LeaseRecord {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: self.config.lease_duration.as_secs() as u32,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
        };

        let current = match self.store.get().await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "error retrieving lease");
                return false;
            }
        };

        let Some(current) = current else {
            return match self.store.create(&desired).await {
                Ok(stored) => {
                    self.observe(&stored, callbacks);
                    true
                }
                Err(e) => {
                    debug!(error = %e, "error initially creating lease");
                    false
                }
            };
        };

        self.observe(&current, callbacks);
        let held_by_us = current.record.is_held_by(identity);
        if !held_by_us {
            if let Some(holder) = current.record.holder() {
                if !self.observed_expired(&current.record) {
                    debug!(%holder, "lease is held by another contender and has not expired");
                    return false;
                }
            }
        }

        if held_by_us {
            desired.acquire_time = current.record.acquire_time;
            desired.lease_transitions = current.record.lease_transitions;
        } else {
            desired.lease_transitions = current.record.lease_transitions.saturating_add(1);
        }

        match self.store.update(&desired, &current.version).await {
            Ok(stored) => {
                self.observe(&stored, callbacks);
                true
            }
            Err(LeaseError::Conflict) => {
                debug!("lease changed while updating, will retry");
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to update lease");
                false
            }
        }
    }

    fn observed_expired(&self, record: &LeaseRecord) -> bool {
        let observation = self.lock_observation();
        let duration = Duration::from_secs(u64::from(record.lease_duration_seconds));
        observation.observed_at + duration <= Instant::now()
    }

    /// Remember `lease` if it differs from the last one seen.
    fn observe(&self, lease: &VersionedLease, callbacks: &dyn LeaderCallbacks) {
        let new_leader = {
            let mut observation = self.lock_observation();
            if observation.lease.as_ref().map(|l| &l.record) != Some(&lease.record) {
                observation.observed_at = Instant::now();
            }
            observation.lease = Some(lease.clone());

            let holder = lease.record.holder().map(str::to_string);
            if holder.is_some() && holder != observation.reported_leader {
                observation.reported_leader = holder.clone();
                holder
            } else {
                None
            }
        };
        if let Some(holder) = new_leader {
            info!(leader = %holder, "new leader elected");
            callbacks.on_new_leader(&holder);
        }
    }

    fn lock_observation(&self) -> std::sync::MutexGuard<'_, Observation> {
        self.observation.lock().unwrap_or_else(|e| {
            warn!("observation lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Clear the holder if this process still holds the lease.
    async fn release(&self) {
        let current = match self.store.get().await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read lease for release");
                return;
            }
        };
        if !current.record.is_held_by(&self.config.identity) {
            debug!("lease no longer held, nothing to release");
            return;
        }
        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration_seconds: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: current.record.lease_transitions,
        };
        match self.store.update(&released, &current.version).await {
            Ok(_) => info!(identity = %self.config.identity, "released leader lease"),
            Err(e) => warn!(error = %e, "failed to release lease"),
        }
    }

    fn jittered_retry_period(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
        self.config.retry_period + self.config.retry_period.mul_f64(factor)
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.config.identity)
            .field("leading", &self.is_leader())
            .finish()
    }
}
