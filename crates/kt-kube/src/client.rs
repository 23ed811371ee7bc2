use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kt_core::config::KubernetesConfig;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// How long a token read from disk is reused before reading it again.
/// Projected service-account tokens are rotated in place by the kubelet.
const TOKEN_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API server answered with a non-success status.
    #[error("API error: {0}")]
    Api(Status),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl KubeError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            KubeError::Api(status) => Some(status.code),
            KubeError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// The requested resource version is too old to watch from.
    pub fn is_gone(&self) -> bool {
        self.status_code() == Some(410)
    }
}

pub type Result<T> = std::result::Result<T, KubeError>;

// ---------------------------------------------------------------------------
// Status (meta/v1)
// ---------------------------------------------------------------------------

/// The API server's error body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// `Success` or `Failure`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default)]
    pub causes: Vec<StatusCause>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCause {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some("Success")
    }

    /// Exit code reported for a `NonZeroExitCode` failure.
    pub fn exit_code(&self) -> Option<i32> {
        if self.reason != "NonZeroExitCode" {
            return None;
        }
        self.details
            .as_ref()?
            .causes
            .iter()
            .find(|c| c.reason == "ExitCode")
            .and_then(|c| c.message.parse().ok())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.reason, self.message)
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum TokenSource {
    None,
    Static(String),
    File {
        path: PathBuf,
        cached: Mutex<Option<(String, Instant)>>,
    },
}

impl TokenSource {
    fn token(&self) -> Option<String> {
        match self {
            TokenSource::None => None,
            TokenSource::Static(token) => Some(token.clone()),
            TokenSource::File { path, cached } => {
                let mut cached = cached.lock().unwrap_or_else(|e| e.into_inner());
                if let Some((token, read_at)) = cached.as_ref() {
                    if read_at.elapsed() < TOKEN_RELOAD_INTERVAL {
                        return Some(token.clone());
                    }
                }
                match std::fs::read_to_string(path) {
                    Ok(text) => {
                        let token = text.trim().to_string();
                        *cached = Some((token.clone(), Instant::now()));
                        Some(token)
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to read service account token");
                        cached.as_ref().map(|(token, _)| token.clone())
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KubeClient {
    base_url: String,
    http: reqwest::Client,
    token: Arc<TokenSource>,
    ca_pem: Option<Arc<Vec<u8>>>,
    insecure: bool,
}

impl KubeClient {
    /// Client for `base_url` with system trust roots.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            token: Arc::new(match token {
                Some(token) => TokenSource::Static(token),
                None => TokenSource::None,
            }),
            ca_pem: None,
            insecure: false,
        })
    }

    /// In-cluster style client: bearer token and CA bundle from files.
    pub fn from_config(config: &KubernetesConfig) -> Result<Self> {
        if config.api_server.trim().is_empty() {
            return Err(KubeError::Config("kubernetes.api_server is empty".into()));
        }

        let mut builder = reqwest::Client::builder();
        let ca_pem = match &config.ca_file {
            Some(path) if path.exists() => {
                let pem = std::fs::read(path)?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
                Some(Arc::new(pem))
            }
            Some(path) => {
                debug!(path = %path.display(), "CA file not found, using system roots");
                None
            }
            None => None,
        };
        if config.insecure_skip_tls_verify {
            warn!("TLS verification of the API server is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let token = match &config.token_file {
            Some(path) => TokenSource::File {
                path: path.clone(),
                cached: Mutex::new(None),
            },
            None => TokenSource::None,
        };

        Ok(Self {
            base_url: config.api_server.trim_end_matches('/').to_string(),
            http: builder.build()?,
            token: Arc::new(token),
            ca_pem,
            insecure: config.insecure_skip_tls_verify,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn bearer_token(&self) -> Option<String> {
        self.token.token()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        match self.bearer_token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Fail with the server's `Status` on a non-success response.
    async fn check(resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let code = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let mut status: Status = serde_json::from_str(&body).unwrap_or_else(|_| Status {
            status: Some("Failure".into()),
            message: body.clone(),
            reason: code.canonical_reason().unwrap_or("").to_string(),
            ..Status::default()
        });
        status.code = code.as_u16();
        Err(KubeError::Api(status))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let resp = self.request(Method::GET, path).query(query).send().await?;
        let resp = Self::check(resp).await?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    pub(crate) async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self.request(method, path).json(body).send().await?;
        let resp = Self::check(resp).await?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    /// Start a streaming GET; the body is read by the caller.
    pub(crate) async fn get_streaming(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Response> {
        let resp = self.request(Method::GET, path).query(query).send().await?;
        Self::check(resp).await
    }

    /// `ws://` or `wss://` form of an API path.
    pub(crate) fn websocket_url(&self, path_and_query: &str) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}{path_and_query}")
    }

    /// TLS connector for WebSocket connections, matching the HTTP client's
    /// trust settings. `None` means the default connector.
    pub(crate) fn tls_connector(&self) -> Result<Option<native_tls::TlsConnector>> {
        if self.ca_pem.is_none() && !self.insecure {
            return Ok(None);
        }
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(pem) = &self.ca_pem {
            builder.add_root_certificate(native_tls::Certificate::from_pem(pem)?);
        }
        if self.insecure {
            builder.danger_accept_invalid_certs(true);
        }
        Ok(Some(builder.build()?))
    }
}
