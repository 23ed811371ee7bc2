use async_trait::async_trait;
use futures_util::stream::StreamExt;
use kt_core::types::ContainerRef;
use kt_session::logs::{LogError, LogOptions, LogSource, LogStream};
use tracing::debug;

use crate::client::KubeClient;

/// Container logs through the pod `log` subresource.
#[derive(Debug, Clone)]
pub struct KubeLogs {
    client: KubeClient,
}

impl KubeLogs {
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }
}

fn log_path(target: &ContainerRef) -> String {
    format!(
        "/api/v1/namespaces/{}/pods/{}/log",
        urlencoding::encode(&target.namespace),
        urlencoding::encode(&target.pod)
    )
}

fn log_query(target: &ContainerRef, options: &LogOptions) -> Vec<(&'static str, String)> {
    let mut query = vec![("container", target.container.clone())];
    if options.follow {
        query.push(("follow", "true".to_string()));
    }
    if let Some(tail) = options.tail_lines {
        query.push(("tailLines", tail.to_string()));
    }
    query
}

#[async_trait]
impl LogSource for KubeLogs {
    async fn stream_logs(
        &self,
        target: &ContainerRef,
        options: &LogOptions,
    ) -> Result<LogStream, LogError> {
        let resp = self
            .client
            .get_streaming(&log_path(target), &log_query(target, options))
            .await
            .map_err(|e| LogError::Backend(e.to_string()))?;
        debug!(%target, ?options, "log stream opened");
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| LogError::Backend(e.to_string())))
            .boxed())
    }
}
