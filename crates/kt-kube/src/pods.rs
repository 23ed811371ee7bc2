use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use kt_core::cache::{WatchError, WatchEvent, WatchSource};
use kt_core::resolve::{LookupError, PodLookup};
use kt_core::types::{ObjectKey, Pod};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::{KubeClient, KubeError, Result, Status};

/// Server-side timeout for one watch request; the watcher reconnects after.
const WATCH_TIMEOUT_SECS: u32 = 300;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Authoritative lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KubePods {
    client: KubeClient,
}

impl KubePods {
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Pod> {
        let path = format!(
            "/api/v1/namespaces/{}/pods/{}",
            urlencoding::encode(&key.namespace),
            urlencoding::encode(&key.name)
        );
        self.client.get_json(&path, &[]).await
    }
}

#[async_trait]
impl PodLookup for KubePods {
    async fn get_pod(&self, key: &ObjectKey) -> std::result::Result<Pod, LookupError> {
        match self.get(key).await {
            Ok(pod) => Ok(pod),
            Err(e) if e.is_not_found() => Err(LookupError::NotFound(key.clone())),
            Err(e) => Err(LookupError::Backend(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// List + watch
// ---------------------------------------------------------------------------

/// Newline-delimited JSON over a streaming response body.
pub(crate) struct LineStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
}

impl LineStream {
    pub(crate) fn new(resp: reqwest::Response) -> Self {
        Self {
            body: resp.bytes_stream().boxed(),
            buf: Vec::new(),
        }
    }

    /// Next non-empty line, or `None` at end of body.
    pub(crate) async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(line));
            }
            match self.body.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None if self.buf.iter().all(u8::is_ascii_whitespace) => return Ok(None),
                None => return Ok(Some(std::mem::take(&mut self.buf))),
            }
        }
    }
}

/// Feeds the pod cache: one list, then watch events from its resource
/// version. Bookmarks advance the version; an expired version (`410 Gone`)
/// starts over with a fresh list.
pub struct KubePodWatcher {
    client: KubeClient,
    namespace: Option<String>,
    resource_version: Option<String>,
    watch: Option<LineStream>,
}

impl KubePodWatcher {
    /// Watch pods in `namespace`, or in all namespaces.
    pub fn new(client: KubeClient, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            resource_version: None,
            watch: None,
        }
    }

    fn path(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("/api/v1/namespaces/{}/pods", urlencoding::encode(ns)),
            None => "/api/v1/pods".to_string(),
        }
    }

    async fn list(&mut self) -> Result<Vec<Pod>> {
        let list: PodList = self.client.get_json(&self.path(), &[]).await?;
        info!(
            pods = list.items.len(),
            resource_version = ?list.metadata.resource_version,
            "listed pods"
        );
        // An empty version would make the watch start from "any", so keep
        // the list result but relist next time.
        self.resource_version = list.metadata.resource_version.filter(|v| !v.is_empty());
        Ok(list.items)
    }

    /// Takes owned arguments so the future holds no borrow of the watcher,
    /// whose line stream is not `Sync`.
    async fn open_watch(
        client: KubeClient,
        path: String,
        resource_version: String,
    ) -> Result<LineStream> {
        let query = [
            ("watch", "1".to_string()),
            ("resourceVersion", resource_version.clone()),
            ("allowWatchBookmarks", "true".to_string()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECS.to_string()),
        ];
        let resp = client.get_streaming(&path, &query).await?;
        debug!(%resource_version, "pod watch opened");
        Ok(LineStream::new(resp))
    }

    fn advance(&mut self, pod: &Pod) {
        if let Some(version) = pod.metadata.resource_version.as_ref().filter(|v| !v.is_empty()) {
            self.resource_version = Some(version.clone());
        }
    }

    fn expire(&mut self) {
        info!("pod resource version expired, relisting");
        self.resource_version = None;
        self.watch = None;
    }
}

fn watch_error(e: KubeError) -> WatchError {
    WatchError::Source(e.to_string())
}

#[async_trait]
impl WatchSource<Pod> for KubePodWatcher {
    async fn next_event(&mut self) -> std::result::Result<Option<WatchEvent<Pod>>, WatchError> {
        loop {
            let Some(version) = self.resource_version.clone() else {
                self.watch = None;
                let pods = self.list().await.map_err(watch_error)?;
                return Ok(Some(WatchEvent::Restarted(pods)));
            };

            if self.watch.is_none() {
                match Self::open_watch(self.client.clone(), self.path(), version).await {
                    Ok(lines) => self.watch = Some(lines),
                    Err(e) if e.is_gone() => {
                        self.expire();
                        continue;
                    }
                    Err(e) => return Err(watch_error(e)),
                }
            }
            let Some(lines) = self.watch.as_mut() else {
                continue;
            };

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("pod watch ended, reconnecting");
                    self.watch = None;
                    continue;
                }
                Err(e) => {
                    self.watch = None;
                    return Err(watch_error(e));
                }
            };

            let event: WatchLine = match serde_json::from_slice(&line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable watch event");
                    continue;
                }
            };

            match event.kind.as_str() {
                "ADDED" | "MODIFIED" | "DELETED" => {
                    let pod: Pod = serde_json::from_value(event.object)
                        .map_err(|e| WatchError::Source(format!("decode pod: {e}")))?;
                    self.advance(&pod);
                    return Ok(Some(if event.kind == "DELETED" {
                        WatchEvent::Deleted(pod)
                    } else {
                        WatchEvent::Applied(pod)
                    }));
                }
                "BOOKMARK" => {
                    if let Ok(pod) = serde_json::from_value::<Pod>(event.object) {
                        self.advance(&pod);
                    }
                }
                "ERROR" => {
                    let status: Status = serde_json::from_value(event.object).unwrap_or_default();
                    if status.code == 410 {
                        self.expire();
                        continue;
                    }
                    self.watch = None;
                    return Err(WatchError::Source(status.to_string()));
                }
                other => debug!(kind = other, "ignoring watch event"),
            }
        }
    }
}
