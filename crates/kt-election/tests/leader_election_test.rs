use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use kt_core::shutdown::ShutdownSignal;
use kt_election::elector::ElectionError;
use kt_election::{
    InMemoryLeaseStore, LeaderCallbacks, LeaderElectionConfig, LeaderElector, LeaseError,
    LeaseRecord, LeaseStore, RunOutcome, VersionedLease,
};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Records callback activity; `active` is shared across contenders.
struct Recorder {
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    started: AtomicUsize,
    stopped: AtomicUsize,
    leaders: Mutex<Vec<String>>,
}

impl Recorder {
    fn new(active: Arc<AtomicUsize>, max_active: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            active,
            max_active,
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            leaders: Mutex::new(Vec::new()),
        })
    }

    fn solo() -> Arc<Self> {
        Self::new(Arc::default(), Arc::default())
    }
}

#[async_trait]
impl LeaderCallbacks for Recorder {
    async fn on_started_leading(&self, term: ShutdownSignal) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        term.triggered().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn on_stopped_leading(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_new_leader(&self, identity: &str) {
        self.leaders.lock().unwrap().push(identity.to_string());
    }
}

/// Wraps a store and fails every call while `down` is set.
struct FlakyStore {
    inner: InMemoryLeaseStore,
    down: AtomicBool,
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError> {
        self.check()?;
        self.inner.get().await
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError> {
        self.check()?;
        self.inner.create(record).await
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        self.check()?;
        self.inner.update(record, version).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

impl FlakyStore {
    fn check(&self) -> Result<(), LeaseError> {
        if self.down.load(Ordering::SeqCst) {
            Err(LeaseError::Store("apiserver unavailable".into()))
        } else {
            Ok(())
        }
    }
}

fn config(identity: &str) -> LeaderElectionConfig {
    LeaderElectionConfig {
        identity: identity.to_string(),
        lease_duration: Duration::from_secs(15),
        renew_deadline: Duration::from_secs(10),
        retry_period: Duration::from_secs(5),
        release_on_cancel: true,
    }
}

fn start(
    identity: &str,
    store: Arc<dyn LeaseStore>,
    callbacks: Arc<Recorder>,
) -> (Arc<LeaderElector>, ShutdownSignal, JoinHandle<RunOutcome>) {
    let elector = Arc::new(LeaderElector::new(config(identity), store).unwrap());
    let shutdown = ShutdownSignal::new();
    let handle = {
        let elector = elector.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { elector.run(callbacks, shutdown).await.unwrap() })
    };
    (elector, shutdown, handle)
}

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// ===========================================================================
// Single contender
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_sole_contender_acquires_and_releases() {
    let store = Arc::new(InMemoryLeaseStore::new("kubeterm"));
    let recorder = Recorder::solo();
    let (elector, shutdown, handle) = start("replica-a", store.clone(), recorder.clone());

    settle(1).await;
    assert!(elector.is_leader());
    assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.leaders.lock().unwrap(), vec!["replica-a"]);

    // Renewals keep the term alive.
    settle(60).await;
    assert!(elector.is_leader());
    assert_eq!(recorder.started.load(Ordering::SeqCst), 1);

    shutdown.trigger();
    assert_eq!(handle.await.unwrap(), RunOutcome::Released);
    assert!(!elector.is_leader());
    assert_eq!(recorder.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.active.load(Ordering::SeqCst), 0);

    let lease = store.get().await.unwrap().unwrap();
    assert_eq!(lease.record.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_acquiring_skips_callbacks() {
    let store = Arc::new(InMemoryLeaseStore::new("kubeterm"));
    store
        .create(&LeaseRecord {
            holder_identity: Some("someone-else".into()),
            lease_duration_seconds: 15,
            ..LeaseRecord::default()
        })
        .await
        .unwrap();
    let recorder = Recorder::solo();
    let (_elector, shutdown, handle) = start("replica-a", store, recorder.clone());

    settle(3).await;
    shutdown.trigger();
    assert_eq!(handle.await.unwrap(), RunOutcome::NotAcquired);
    assert_eq!(recorder.started.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.stopped.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let store = Arc::new(InMemoryLeaseStore::new("kubeterm"));
    let mut cfg = config("replica-a");
    cfg.retry_period = Duration::ZERO;
    assert!(matches!(
        LeaderElector::new(cfg, store),
        Err(ElectionError::InvalidConfig(_))
    ));
}

// ===========================================================================
// Multiple contenders
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_at_most_one_leader_and_handoff_on_release() {
    let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new("kubeterm"));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let rec_a = Recorder::new(active.clone(), max_active.clone());
    let rec_b = Recorder::new(active.clone(), max_active.clone());

    let (a, stop_a, handle_a) = start("replica-a", store.clone(), rec_a.clone());
    settle(1).await;
    let (b, stop_b, handle_b) = start("replica-b", store.clone(), rec_b.clone());

    settle(60).await;
    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(rec_b.started.load(Ordering::SeqCst), 0);

    stop_a.trigger();
    assert_eq!(handle_a.await.unwrap(), RunOutcome::Released);

    // B sees the released lease on its next attempt, no expiry wait needed.
    settle(12).await;
    assert!(b.is_leader());
    assert_eq!(rec_b.started.load(Ordering::SeqCst), 1);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    let lease = store.get().await.unwrap().unwrap();
    assert!(lease.record.is_held_by("replica-b"));
    assert_eq!(lease.record.lease_transitions, 1);
    assert!(rec_b.leaders.lock().unwrap().contains(&"replica-a".to_string()));

    stop_b.trigger();
    assert_eq!(handle_b.await.unwrap(), RunOutcome::Released);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_lease_is_taken_over_after_local_expiry() {
    let store = Arc::new(InMemoryLeaseStore::new("kubeterm"));
    // Remote timestamps far in the past must not shorten the wait.
    let long_ago = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
    store
        .create(&LeaseRecord {
            holder_identity: Some("crashed-replica".into()),
            lease_duration_seconds: 15,
            acquire_time: Some(long_ago),
            renew_time: Some(long_ago),
            lease_transitions: 4,
        })
        .await
        .unwrap();

    let recorder = Recorder::solo();
    let (elector, shutdown, handle) = start("replica-b", store.clone(), recorder.clone());

    settle(10).await;
    assert!(!elector.is_leader(), "lease must not be taken before it expires locally");

    settle(30).await;
    assert!(elector.is_leader());
    let lease = store.get().await.unwrap().unwrap();
    assert!(lease.record.is_held_by("replica-b"));
    assert_eq!(lease.record.lease_transitions, 5);
    assert_eq!(
        *recorder.leaders.lock().unwrap(),
        vec!["crashed-replica", "replica-b"]
    );

    shutdown.trigger();
    handle.await.unwrap();
}

// ===========================================================================
// Loss
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_renewals_end_the_term() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryLeaseStore::new("kubeterm"),
        down: AtomicBool::new(false),
    });
    let recorder = Recorder::solo();
    let (elector, _shutdown, handle) = start("replica-a", store.clone(), recorder.clone());

    settle(1).await;
    assert!(elector.is_leader());

    store.down.store(true, Ordering::SeqCst);
    let outcome = tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("term should end")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Lost);
    assert!(!elector.is_leader());
    assert_eq!(recorder.active.load(Ordering::SeqCst), 0, "work must stop");
    assert_eq!(recorder.stopped.load(Ordering::SeqCst), 1);
}
