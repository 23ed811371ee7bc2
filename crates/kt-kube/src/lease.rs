use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kt_election::lease::{LeaseError, LeaseRecord, LeaseStore, VersionedLease};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::client::{KubeClient, KubeError};

// ---------------------------------------------------------------------------
// Wire types (coordination.k8s.io/v1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseMeta {
    name: String,
    namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    holder_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_duration_seconds: Option<u32>,
    #[serde(default, with = "micro_time", skip_serializing_if = "Option::is_none")]
    acquire_time: Option<DateTime<Utc>>,
    #[serde(default, with = "micro_time", skip_serializing_if = "Option::is_none")]
    renew_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_transitions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Lease {
    #[serde(default = "api_version")]
    api_version: String,
    #[serde(default = "kind")]
    kind: String,
    metadata: LeaseMeta,
    #[serde(default)]
    spec: LeaseSpec,
}

fn api_version() -> String {
    "coordination.k8s.io/v1".into()
}
fn kind() -> String {
    "Lease".into()
}

/// `MicroTime`: RFC 3339 with exactly six fractional digits.
mod micro_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<DateTime<Utc>>::deserialize(d)
    }
}

impl Lease {
    fn from_record(meta: LeaseMeta, record: &LeaseRecord) -> Self {
        Self {
            api_version: api_version(),
            kind: kind(),
            metadata: meta,
            spec: LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration_seconds),
                acquire_time: record.acquire_time,
                renew_time: record.renew_time,
                lease_transitions: Some(record.lease_transitions),
            },
        }
    }

    fn into_versioned(self) -> VersionedLease {
        VersionedLease {
            version: self.metadata.resource_version.unwrap_or_default(),
            record: LeaseRecord {
                holder_identity: self.spec.holder_identity,
                lease_duration_seconds: self.spec.lease_duration_seconds.unwrap_or_default(),
                acquire_time: self.spec.acquire_time,
                renew_time: self.spec.renew_time,
                lease_transitions: self.spec.lease_transitions.unwrap_or_default(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// KubeLeaseStore
// ---------------------------------------------------------------------------

/// Lease record stored as a `Lease` object; updates are guarded by
/// `metadata.resourceVersion`.
#[derive(Debug, Clone)]
pub struct KubeLeaseStore {
    client: KubeClient,
    namespace: String,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: KubeClient, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn collection_path(&self) -> String {
        format!(
            "/apis/coordination.k8s.io/v1/namespaces/{}/leases",
            self.namespace
        )
    }

    fn object_path(&self) -> String {
        format!("{}/{}", self.collection_path(), self.name)
    }

    fn meta(&self, resource_version: Option<String>) -> LeaseMeta {
        LeaseMeta {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            resource_version,
        }
    }
}

fn lease_error(e: KubeError) -> LeaseError {
    if e.is_conflict() {
        LeaseError::Conflict
    } else {
        LeaseError::Store(e.to_string())
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<VersionedLease>, LeaseError> {
        match self.client.get_json::<Lease>(&self.object_path(), &[]).await {
            Ok(lease) => Ok(Some(lease.into_versioned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(lease_error(e)),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease, LeaseError> {
        let body = Lease::from_record(self.meta(None), record);
        let created: Lease = self
            .client
            .send_json(Method::POST, &self.collection_path(), &body)
            .await
            .map_err(lease_error)?;
        Ok(created.into_versioned())
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        let body = Lease::from_record(self.meta(Some(version.to_string())), record);
        let updated: Lease = self
            .client
            .send_json(Method::PUT, &self.object_path(), &body)
            .await
            .map_err(lease_error)?;
        Ok(updated.into_versioned())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
