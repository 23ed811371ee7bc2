use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kt_core::config::{BackendKind, Config, LogFormat};

/// Web terminal and log viewer for Kubernetes containers.
#[derive(Debug, Parser)]
#[command(name = "kubeterm", version, about)]
pub struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long, env = "KUBETERM_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub bind_address: Option<IpAddr>,

    /// ERROR, WARN, INFO, DEBUG or TRACE.
    #[arg(long)]
    pub log_level: Option<String>,

    /// TEXT or JSON.
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// `/dev/stdout`, `/dev/stderr` or a file path.
    #[arg(long)]
    pub log_output: Option<String>,

    /// `kubernetes` or `local`.
    #[arg(long)]
    pub backend: Option<BackendKind>,

    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// Namespace of the leader lease.
    #[arg(long, env = "NAMESPACE")]
    pub lease_namespace: Option<String>,

    /// Contender identity for leader election.
    #[arg(long, env = "NAME")]
    pub identity: Option<String>,
}

impl Cli {
    /// Load the config file (if any), apply flag overrides and validate.
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::default(),
        };
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(addr) = self.bind_address {
            config.server.bind_address = addr;
        }
        if let Some(dir) = self.static_dir {
            config.server.static_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(output) = self.log_output {
            config.logging.output = output;
        }
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(ns) = self.lease_namespace.filter(|ns| !ns.is_empty()) {
            config.election.lease_namespace = Some(ns);
        }
        if let Some(identity) = self.identity.filter(|id| !id.is_empty()) {
            config.election.identity = Some(identity);
        }
    }
}
