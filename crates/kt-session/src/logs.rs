use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use kt_core::types::ContainerRef;
use thiserror::Error;

/// Chunks of container log output, in order.
pub type LogStream = BoxStream<'static, Result<Bytes, LogError>>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log streaming is not supported: {0}")]
    Unsupported(String),
    #[error("log stream failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Only the last N lines; everything when `None`.
    pub tail_lines: Option<i64>,
    /// Keep streaming new lines.
    pub follow: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail_lines: None,
            follow: true,
        }
    }
}

impl LogOptions {
    /// Options for a `?tail=N` query value; zero or absent means all lines.
    pub fn from_tail(tail: Option<i64>) -> Self {
        Self {
            tail_lines: tail.filter(|n| *n > 0),
            follow: true,
        }
    }
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn stream_logs(
        &self,
        target: &ContainerRef,
        options: &LogOptions,
    ) -> Result<LogStream, LogError>;
}
