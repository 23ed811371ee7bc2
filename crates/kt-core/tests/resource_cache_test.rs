use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kt_core::cache::{Reflector, ResourceCache, WatchError, WatchEvent, WatchSource};
use kt_core::resolve::{LookupError, PodLookup, PodResolver, ResolveError, ResolvedFrom};
use kt_core::shutdown::ShutdownSignal;
use kt_core::types::{ContainerRef, ObjectKey, Pod};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Scripted watch source: yields the queued results, then waits forever.
struct ScriptedSource {
    events: VecDeque<Result<WatchEvent<Pod>, WatchError>>,
}

impl ScriptedSource {
    fn new(events: Vec<Result<WatchEvent<Pod>, WatchError>>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

#[async_trait]
impl WatchSource<Pod> for ScriptedSource {
    async fn next_event(&mut self) -> Result<Option<WatchEvent<Pod>>, WatchError> {
        match self.events.pop_front() {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => std::future::pending().await,
        }
    }
}

/// Authority backed by a fixed pod list, counting calls.
struct FixedAuthority {
    pods: Vec<Pod>,
    calls: AtomicUsize,
    fail: bool,
}

impl FixedAuthority {
    fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            pods: Vec::new(),
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl PodLookup for FixedAuthority {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LookupError::Backend("connection refused".into()));
        }
        self.pods
            .iter()
            .find(|p| p.metadata.namespace == key.namespace && p.metadata.name == key.name)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(key.clone()))
    }
}

fn nginx() -> Pod {
    Pod::with_containers("default", "nginx", ["nginx"])
}

// ===========================================================================
// ResourceCache
// ===========================================================================

#[test]
fn test_lookup_unknown_key_misses() {
    let cache: ResourceCache<Pod> = ResourceCache::new();
    assert!(cache.lookup("default", "nginx").is_none());
    assert!(!cache.has_synced());
}

#[test]
fn test_applied_object_becomes_visible() {
    let cache = ResourceCache::new();
    cache.apply(WatchEvent::Applied(nginx()));

    let pod = cache.lookup("default", "nginx").expect("pod should be cached");
    assert_eq!(pod.metadata.name, "nginx");
    assert!(cache.lookup("other", "nginx").is_none());
}

#[test]
fn test_deleted_object_disappears() {
    let cache = ResourceCache::new();
    cache.apply(WatchEvent::Applied(nginx()));
    cache.apply(WatchEvent::Deleted(nginx()));
    assert!(cache.lookup("default", "nginx").is_none());
}

#[test]
fn test_restart_replaces_contents_and_marks_synced() {
    let cache = ResourceCache::new();
    cache.apply(WatchEvent::Applied(Pod::with_containers("default", "stale", ["app"])));
    cache.apply(WatchEvent::Restarted(vec![
        nginx(),
        Pod::with_containers("kube-system", "coredns", ["coredns"]),
    ]));

    assert!(cache.has_synced());
    assert_eq!(cache.len(), 2);
    assert!(cache.lookup("default", "stale").is_none());
    assert!(cache.lookup("kube-system", "coredns").is_some());
}

#[test]
fn test_clones_share_entries() {
    let cache = ResourceCache::new();
    let reader = cache.clone();
    cache.apply(WatchEvent::Applied(nginx()));
    assert!(reader.lookup("default", "nginx").is_some());
}

// ===========================================================================
// Reflector
// ===========================================================================

#[tokio::test]
async fn test_reflector_populates_cache_eventually() {
    let cache = ResourceCache::new();
    let source = ScriptedSource::new(vec![
        Ok(WatchEvent::Restarted(vec![])),
        Ok(WatchEvent::Applied(nginx())),
    ]);
    let stop = ShutdownSignal::new();
    let reflector = Reflector::new(cache.clone());
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move { reflector.run(source, stop).await })
    };

    tokio::time::timeout(Duration::from_secs(1), cache.wait_for_sync())
        .await
        .expect("cache should sync");
    tokio::time::timeout(Duration::from_secs(1), async {
        while cache.lookup("default", "nginx").is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("applied pod should become visible");

    stop.trigger();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("reflector should stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reflector_retries_after_source_error() {
    let cache = ResourceCache::new();
    let source = ScriptedSource::new(vec![
        Err(WatchError::Source("410 Gone".into())),
        Ok(WatchEvent::Restarted(vec![nginx()])),
    ]);
    let stop = ShutdownSignal::new();
    let reflector = Reflector::new(cache.clone()).with_backoff(Duration::from_millis(100));
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move { reflector.run(source, stop).await })
    };

    cache.wait_for_sync().await;
    assert!(cache.lookup("default", "nginx").is_some());

    stop.trigger();
    task.await.unwrap();
}

// ===========================================================================
// PodResolver
// ===========================================================================

#[tokio::test]
async fn test_cache_hit_skips_authority() {
    let cache = ResourceCache::new();
    cache.apply(WatchEvent::Applied(nginx()));
    let authority = Arc::new(FixedAuthority::new(vec![]));
    let resolver = PodResolver::new(cache, authority.clone());

    let resolved = resolver
        .resolve(&ObjectKey::new("default", "nginx"))
        .await
        .unwrap();
    assert_eq!(resolved.source, ResolvedFrom::Cache);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cache_miss_falls_back_to_authority() {
    let authority = Arc::new(FixedAuthority::new(vec![nginx()]));
    let resolver = PodResolver::new(ResourceCache::new(), authority.clone());

    let resolved = resolver
        .resolve(&ObjectKey::new("default", "nginx"))
        .await
        .unwrap();
    assert_eq!(resolved.source, ResolvedFrom::Authority);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    let resolver = PodResolver::new(ResourceCache::new(), Arc::new(FixedAuthority::new(vec![])));
    let err = resolver
        .resolve(&ObjectKey::new("default", "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::PodNotFound(_)));
}

#[tokio::test]
async fn test_authority_failure_surfaces_as_lookup_error() {
    let resolver = PodResolver::new(ResourceCache::new(), Arc::new(FixedAuthority::failing()));
    let err = resolver
        .resolve(&ObjectKey::new("default", "nginx"))
        .await
        .unwrap_err();
    match err {
        ResolveError::Lookup { key, reason } => {
            assert_eq!(key.to_string(), "default/nginx");
            assert!(reason.contains("connection refused"));
        }
        other => panic!("expected lookup error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stale_cache_without_container_defers_to_authority() {
    let cache = ResourceCache::new();
    cache.apply(WatchEvent::Applied(nginx()));
    // The pod was recreated with a sidecar the watch has not seen yet.
    let fresh = Pod::with_containers("default", "nginx", ["nginx", "debug"]);
    let authority = Arc::new(FixedAuthority::new(vec![fresh]));
    let resolver = PodResolver::new(cache, authority.clone());

    let resolved = resolver
        .resolve_container(&ContainerRef::new("default", "nginx", "debug"))
        .await
        .unwrap();
    assert_eq!(resolved.source, ResolvedFrom::Authority);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_container_is_rejected() {
    let authority = Arc::new(FixedAuthority::new(vec![nginx()]));
    let resolver = PodResolver::new(ResourceCache::new(), authority);

    let err = resolver
        .resolve_container(&ContainerRef::new("default", "nginx", "debug"))
        .await
        .unwrap_err();
    match err {
        ResolveError::ContainerNotFound {
            container,
            available,
            ..
        } => {
            assert_eq!(container, "debug");
            assert_eq!(available, "nginx");
        }
        other => panic!("expected container not found, got {other:?}"),
    }
}
