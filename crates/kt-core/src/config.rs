use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded once at startup from a TOML file and
/// then overridden by command-line flags.
///
/// The value is immutable after [`Config::validate`] succeeds; components
/// receive it (or the section they need) through their constructors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.election.validate()?;
        self.logging.validate()?;
        if self.terminal.shells.is_empty() {
            return Err(ConfigError::Validation(
                "terminal.shells must name at least one shell".into(),
            ));
        }
        if self.backend.kind == BackendKind::Local && self.local.max_ptys == 0 {
            return Err(ConfigError::Validation(
                "local.max_ptys must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding `terminal.html`, `logs.html` and their scripts.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            static_dir: default_static_dir(),
        }
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8080
}
fn default_static_dir() -> PathBuf {
    PathBuf::from("./frontend")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Kubernetes,
    /// Development backend: pods come from `[local]` and shells run in a local PTY.
    Local,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::Validation(format!("unknown backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// API server base URL. Defaults to the in-cluster service address.
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(default = "default_token_file")]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_ca_file")]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Restrict the pod watch to one namespace; all namespaces when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            token_file: default_token_file(),
            ca_file: default_ca_file(),
            insecure_skip_tls_verify: false,
            watch_namespace: None,
        }
    }
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

fn default_api_server() -> String {
    match (
        std::env::var("KUBERNETES_SERVICE_HOST"),
        std::env::var("KUBERNETES_SERVICE_PORT"),
    ) {
        (Ok(host), Ok(port)) if host.contains(':') => format!("https://[{host}]:{port}"),
        (Ok(host), Ok(port)) => format!("https://{host}:{port}"),
        _ => "https://kubernetes.default.svc".into(),
    }
}
fn default_token_file() -> Option<PathBuf> {
    Some(Path::new(SERVICE_ACCOUNT_DIR).join("token"))
}
fn default_ca_file() -> Option<PathBuf> {
    Some(Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt"))
}

/// What to do when an acquired lease is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossPolicy {
    /// Terminate the process so no two replicas ever both act as leader.
    #[default]
    Exit,
    /// Stop the gated work and contend again without restarting.
    Demote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    /// Namespace holding the lease record (env `NAMESPACE` in deployments).
    #[serde(default)]
    pub lease_namespace: Option<String>,
    /// Contender identity (env `NAME`); a random one is generated when unset.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_secs: u64,
    #[serde(default = "default_retry_period")]
    pub retry_period_secs: u64,
    #[serde(default = "default_true")]
    pub release_on_cancel: bool,
    #[serde(default)]
    pub on_loss: LossPolicy,
}

impl ElectionConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_deadline_secs)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_period_secs == 0 {
            return Err(ConfigError::Validation(
                "election.retry_period_secs must be greater than zero".into(),
            ));
        }
        if self.lease_duration_secs <= self.renew_deadline_secs {
            return Err(ConfigError::Validation(format!(
                "election.lease_duration_secs ({}) must be greater than renew_deadline_secs ({})",
                self.lease_duration_secs, self.renew_deadline_secs
            )));
        }
        if self.renew_deadline_secs <= self.retry_period_secs {
            return Err(ConfigError::Validation(format!(
                "election.renew_deadline_secs ({}) must be greater than retry_period_secs ({})",
                self.renew_deadline_secs, self.retry_period_secs
            )));
        }
        if self.lease_name.trim().is_empty() {
            return Err(ConfigError::Validation("election.lease_name is empty".into()));
        }
        Ok(())
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: default_lease_name(),
            lease_namespace: None,
            identity: None,
            lease_duration_secs: default_lease_duration(),
            renew_deadline_secs: default_renew_deadline(),
            retry_period_secs: default_retry_period(),
            release_on_cancel: true,
            on_loss: LossPolicy::Exit,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_lease_name() -> String {
    "kubeterm".into()
}
fn default_lease_duration() -> u64 {
    15
}
fn default_renew_deadline() -> u64 {
    10
}
fn default_retry_period() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Shells tried in order until one starts.
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
    /// How long a remote exec may keep running after the client hung up.
    #[serde(default = "default_eof_grace_ms")]
    pub exec_eof_grace_ms: u64,
}

impl TerminalConfig {
    pub fn exec_eof_grace(&self) -> Duration {
        Duration::from_millis(self.exec_eof_grace_ms)
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shells: default_shells(),
            exec_eof_grace_ms: default_eof_grace_ms(),
        }
    }
}

fn default_shells() -> Vec<String> {
    vec!["bash".into(), "sh".into()]
}
fn default_eof_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TEXT" => Ok(Self::Text),
            "JSON" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "log format must be TEXT or JSON, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of ERROR, WARN, WARNING, INFO, DEBUG, TRACE (case-insensitive).
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// `/dev/stdout`, `/dev/stderr` or a file path.
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl LoggingConfig {
    /// The level as a `tracing` filter directive.
    pub fn filter_directive(&self) -> Result<&'static str, ConfigError> {
        match self.level.to_ascii_uppercase().as_str() {
            "ERROR" => Ok("error"),
            "WARN" | "WARNING" => Ok("warn"),
            "INFO" => Ok("info"),
            "DEBUG" => Ok("debug"),
            "TRACE" => Ok("trace"),
            other => Err(ConfigError::Validation(format!("unknown log level '{other}'"))),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.filter_directive().map(|_| ())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            output: default_log_output(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".into()
}
fn default_log_output() -> String {
    "/dev/stdout".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_max_ptys")]
    pub max_ptys: usize,
    #[serde(default)]
    pub pods: Vec<LocalPod>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_ptys: default_max_ptys(),
            pods: Vec::new(),
        }
    }
}

fn default_max_ptys() -> usize {
    16
}

/// A pod served by the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalPod {
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_local_containers")]
    pub containers: Vec<String>,
    /// Working directory for shells started "inside" this pod.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

fn default_local_containers() -> Vec<String> {
    vec!["main".into()]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config must validate");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.terminal.shells, vec!["bash", "sh"]);
        assert_eq!(cfg.election.lease_duration(), Duration::from_secs(15));
        assert_eq!(cfg.election.on_loss, LossPolicy::Exit);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.server.listen_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.backend.kind, BackendKind::Kubernetes);
    }

    #[test]
    fn renew_deadline_must_be_shorter_than_lease() {
        let err = Config::from_toml(
            "[election]\nlease_duration_secs = 10\nrenew_deadline_secs = 10\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn retry_period_must_be_shorter_than_renew_deadline() {
        let err = Config::from_toml(
            "[election]\nrenew_deadline_secs = 5\nretry_period_secs = 5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry_period_secs"));
    }

    #[test]
    fn log_level_accepts_warning_alias() {
        let cfg = Config::from_toml("[logging]\nlevel = \"Warning\"\n").unwrap();
        assert_eq!(cfg.logging.filter_directive().unwrap(), "warn");
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(Config::from_toml("[logging]\nlevel = \"LOUD\"\n").is_err());
    }

    #[test]
    fn parse_local_backend() {
        let cfg = Config::from_toml(
            r#"
            [backend]
            kind = "local"

            [[local.pods]]
            namespace = "default"
            name = "nginx"
            containers = ["nginx", "sidecar"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend.kind, BackendKind::Local);
        assert_eq!(cfg.local.pods.len(), 1);
        assert_eq!(cfg.local.pods[0].containers, vec!["nginx", "sidecar"]);
    }

    #[test]
    fn backend_and_format_from_str() {
        assert_eq!("K8S".parse::<BackendKind>().unwrap(), BackendKind::Kubernetes);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_sections() {
        let mut cfg = Config::default();
        cfg.server.port = 9000;
        cfg.election.on_loss = LossPolicy::Demote;
        let text = cfg.to_toml().unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.election.on_loss, LossPolicy::Demote);
    }
}
