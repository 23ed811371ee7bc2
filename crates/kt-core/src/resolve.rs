use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cache::ResourceCache;
use crate::types::{ContainerRef, ObjectKey, Pod};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("pod '{0}' not found")]
    NotFound(ObjectKey),
    #[error("pod lookup failed: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("pod '{0}' not found")]
    PodNotFound(ObjectKey),
    #[error("container '{container}' not found in pod '{pod}' (containers: {available})")]
    ContainerNotFound {
        pod: ObjectKey,
        container: String,
        available: String,
    },
    #[error("failed to resolve pod '{key}': {reason}")]
    Lookup { key: ObjectKey, reason: String },
}

// ---------------------------------------------------------------------------
// Authoritative lookup
// ---------------------------------------------------------------------------

/// Authoritative pod lookup (the API server, or the local inventory).
#[async_trait]
pub trait PodLookup: Send + Sync {
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, LookupError>;
}

/// Where a resolved pod came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    Cache,
    Authority,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub pod: Arc<Pod>,
    pub source: ResolvedFrom,
}

// ---------------------------------------------------------------------------
// PodResolver
// ---------------------------------------------------------------------------

/// Cache-first pod resolution with an authoritative fallback.
///
/// A cache hit is served without I/O. A miss is re-resolved through the
/// authority, whose answer is final even if it contradicts the cache.
#[derive(Clone)]
pub struct PodResolver {
    cache: ResourceCache<Pod>,
    authority: Arc<dyn PodLookup>,
}

impl PodResolver {
    pub fn new(cache: ResourceCache<Pod>, authority: Arc<dyn PodLookup>) -> Self {
        Self { cache, authority }
    }

    pub fn cache(&self) -> &ResourceCache<Pod> {
        &self.cache
    }

    /// Resolve a pod by key.
    pub async fn resolve(&self, key: &ObjectKey) -> Result<Resolved, ResolveError> {
        if let Some(pod) = self.cache.get(key) {
            debug!(pod = %key, "pod resolved from cache");
            return Ok(Resolved {
                pod,
                source: ResolvedFrom::Cache,
            });
        }
        info!(pod = %key, "pod not in cache, querying authority");
        self.resolve_authoritative(key).await
    }

    /// Resolve the pod behind `target` and check that it has the container.
    ///
    /// A cached pod that lacks the container is not trusted: the pod may have
    /// been recreated since the watch last saw it, so the authority decides.
    pub async fn resolve_container(&self, target: &ContainerRef) -> Result<Resolved, ResolveError> {
        let key = target.pod_key();
        let resolved = self.resolve(&key).await?;
        if resolved.pod.has_container(&target.container) {
            return Ok(resolved);
        }
        let resolved = match resolved.source {
            ResolvedFrom::Cache => {
                debug!(%target, "cached pod lacks container, re-resolving");
                self.resolve_authoritative(&key).await?
            }
            ResolvedFrom::Authority => resolved,
        };
        if resolved.pod.has_container(&target.container) {
            Ok(resolved)
        } else {
            Err(ResolveError::ContainerNotFound {
                pod: key,
                container: target.container.clone(),
                available: resolved.pod.container_names().join(", "),
            })
        }
    }

    async fn resolve_authoritative(&self, key: &ObjectKey) -> Result<Resolved, ResolveError> {
        match self.authority.get_pod(key).await {
            Ok(pod) => Ok(Resolved {
                pod: Arc::new(pod),
                source: ResolvedFrom::Authority,
            }),
            Err(LookupError::NotFound(key)) => Err(ResolveError::PodNotFound(key)),
            Err(LookupError::Backend(reason)) => Err(ResolveError::Lookup {
                key: key.clone(),
                reason,
            }),
        }
    }
}

impl std::fmt::Debug for PodResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
