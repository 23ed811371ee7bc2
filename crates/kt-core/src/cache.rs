//! Watch-populated, read-shared object cache.
//!
//! [`ResourceCache`] is a local index of `(namespace, name) -> Arc<T>`. It is
//! written only by a [`Reflector`] draining a [`WatchSource`], and read by any
//! number of request handlers. Lookups never perform I/O; a miss means the
//! object is absent *or* has not been observed yet, and callers must fall
//! back to an authoritative lookup (see [`crate::resolve`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;
use crate::types::{ObjectKey, Resource};

/// Delay before polling a watch source again after it failed.
pub const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Watch events
// ---------------------------------------------------------------------------

/// One change observed by a watch source.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    /// A full listing; replaces the cache contents.
    Restarted(Vec<T>),
    /// An object was added or modified.
    Applied(T),
    /// An object was deleted.
    Deleted(T),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch source failed: {0}")]
    Source(String),
}

/// Supplies watch events for one resource kind.
#[async_trait]
pub trait WatchSource<T>: Send {
    /// Next event; `Ok(None)` once the source is exhausted for good.
    async fn next_event(&mut self) -> Result<Option<WatchEvent<T>>, WatchError>;
}

#[async_trait]
impl<T, S> WatchSource<T> for Box<S>
where
    T: Send,
    S: WatchSource<T> + ?Sized,
{
    async fn next_event(&mut self) -> Result<Option<WatchEvent<T>>, WatchError> {
        (**self).next_event().await
    }
}

// ---------------------------------------------------------------------------
// ResourceCache
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to a shared object index.
pub struct ResourceCache<T> {
    entries: Arc<DashMap<ObjectKey, Arc<T>>>,
    synced_tx: Arc<watch::Sender<bool>>,
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            synced_tx: self.synced_tx.clone(),
        }
    }
}

impl<T: Resource> ResourceCache<T> {
    pub fn new() -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            entries: Arc::new(DashMap::new()),
            synced_tx: Arc::new(synced_tx),
        }
    }

    /// Get a cached object. Never blocks on the network.
    pub fn lookup(&self, namespace: &str, name: &str) -> Option<Arc<T>> {
        self.get(&ObjectKey::new(namespace, name))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a full listing has been applied at least once.
    pub fn has_synced(&self) -> bool {
        *self.synced_tx.borrow()
    }

    /// Wait until the first full listing has been applied.
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced_tx.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Apply one watch event. Each entry is replaced atomically.
    pub fn apply(&self, event: WatchEvent<T>) {
        match event {
            WatchEvent::Restarted(objects) => {
                let fresh: std::collections::HashSet<ObjectKey> =
                    objects.iter().map(Resource::key).collect();
                self.entries.retain(|key, _| fresh.contains(key));
                for object in objects {
                    self.entries.insert(object.key(), Arc::new(object));
                }
                self.synced_tx.send_replace(true);
            }
            WatchEvent::Applied(object) => {
                self.entries.insert(object.key(), Arc::new(object));
            }
            WatchEvent::Deleted(object) => {
                self.entries.remove(&object.key());
            }
        }
    }
}

impl<T: Resource> Default for ResourceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("entries", &self.entries.len())
            .field("synced", &*self.synced_tx.borrow())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Reflector
// ---------------------------------------------------------------------------

/// Drains a watch source into a cache until stopped.
pub struct Reflector<T> {
    cache: ResourceCache<T>,
    backoff: Duration,
}

impl<T: Resource> Reflector<T> {
    pub fn new(cache: ResourceCache<T>) -> Self {
        Self {
            cache,
            backoff: WATCH_RETRY_BACKOFF,
        }
    }

    /// Override the delay applied after a source error.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `stop` fires or the source is exhausted.
    ///
    /// Source errors are logged and retried after the backoff; the source is
    /// expected to recover on its own (e.g. by relisting).
    pub async fn run<S>(&self, mut source: S, stop: ShutdownSignal)
    where
        S: WatchSource<T>,
    {
        info!("starting resource reflector");
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.triggered() => break,
                next = source.next_event() => next,
            };
            match next {
                Ok(Some(event)) => {
                    if let WatchEvent::Restarted(objects) = &event {
                        info!(count = objects.len(), "resource cache relisted");
                    }
                    self.cache.apply(event);
                }
                Ok(None) => {
                    debug!("watch source exhausted");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "watch failed, retrying");
                    tokio::select! {
                        biased;
                        _ = stop.triggered() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
        info!("resource reflector stopped");
    }
}
