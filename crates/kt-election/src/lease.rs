use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// LeaseRecord
// ---------------------------------------------------------------------------

/// The shared leadership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Current holder; `None` (or empty) when released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    #[serde(default)]
    pub lease_duration_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_transitions: u32,
}

impl LeaseRecord {
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }
}

/// A record together with the store version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub version: String,
}

// ---------------------------------------------------------------------------
// LeaseStore
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LeaseError {
    /// The record changed (or appeared) since it was read.
    #[error("lease was modified concurrently")]
    Conflict,
    #[error("lease store error: {0}")]
    Store(String),
}

/// Storage for one lease record with compare-and-swap updates.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current record, or `None` if it does not exist yet.
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError>;

    /// Create the record; [`LeaseError::Conflict`] if it already exists.
    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError>;

    /// Replace the record if it is still at `version`.
    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError>;

    /// Human-readable location of the record, for logs.
    fn describe(&self) -> String;
}

/// Process-local lease store, for a single replica or for tests.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    name: String,
    current: Mutex<Option<VersionedLease>>,
    next_version: AtomicU64,
}

impl InMemoryLeaseStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: Mutex::new(None),
            next_version: AtomicU64::new(1),
        }
    }

    fn stamp(&self, record: &LeaseRecord) -> VersionedLease {
        VersionedLease {
            record: record.clone(),
            version: self.next_version.fetch_add(1, Ordering::Relaxed).to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError> {
        Ok(self.current.lock().await.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError> {
        let mut current = self.current.lock().await;
        if current.is_some() {
            return Err(LeaseError::Conflict);
        }
        let stored = self.stamp(record);
        *current = Some(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(existing) if existing.version == version => {
                let stored = self.stamp(record);
                *current = Some(stored.clone());
                Ok(stored)
            }
            _ => Err(LeaseError::Conflict),
        }
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.name)
    }
}
