use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "relaymeshd", version, about = "Reverse TCP/TLS proxy with discovery-driven upstream churn")]
pub struct Cli {
    #[arg(long, default_value = "relaymesh.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Socket family/kind used for both listen and dial.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

/// Inbound TLS parameters. Presence of `client_ca` switches termination from
/// plain server-auth TLS to mutual TLS (accepted connections must present a
/// client certificate verified against `client_ca`).
#[derive(Debug, Deserialize, Clone)]
pub struct TlsServerConfig {
    pub cert: String,
    pub key: String,
    pub client_ca: Option<String>,
}

/// Outbound TLS parameters. `cert`/`key` present together means the proxy
/// presents a client certificate when dialing upstream (mTLS origination);
/// `ca` verifies the upstream's certificate (platform webpki roots are used
/// when absent).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsClientConfig {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
    /// Overrides the DNS name used for certificate verification; defaults to
    /// the host portion of the dialed upstream address.
    pub server_name: Option<String>,
}

/// Discovery registry configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct DiscOptions {
    pub service: String,
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub after_index: u64,
}

/// Configuration for a single Proxy Instance (`to` / `srv`) or, with
/// `from_range` populated, a Cluster Supervisor (`cluster_to` / `cluster_srv`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnOptions {
    #[serde(default)]
    pub transport: Transport,

    pub from: Option<String>,
    #[serde(default)]
    pub from_range: Vec<String>,

    #[serde(default)]
    pub to: Vec<String>,

    #[serde(default)]
    pub balance: bool,

    pub tls_server: Option<TlsServerConfig>,
    pub tls_client: Option<TlsClientConfig>,

    pub discovery: Option<DiscOptions>,

    /// Per-direction idle deadlines, in seconds.
    pub read_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
}

impl ConnOptions {
    pub fn read_timeout(&self) -> Option<std::time::Duration> {
        self.read_timeout_secs.map(std::time::Duration::from_secs)
    }

    pub fn write_timeout(&self) -> Option<std::time::Duration> {
        self.write_timeout_secs.map(std::time::Duration::from_secs)
    }
}

/// Top-level YAML document for the binary: either a single instance (`to`/`srv`)
/// or a cluster (`cluster_to`/`cluster_srv`), selected by `mode`.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AppConfig {
    To(ConnOptions),
    Srv(ConnOptions),
    ClusterTo(ConnOptions),
    ClusterSrv(ConnOptions),
}

pub fn load_config() -> Result<(Cli, AppConfig)> {
    let cli = Cli::parse();

    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read {}", cli.config.display()))?;

    let cfg: AppConfig = serde_yaml::from_str(&yaml).context("Failed to parse YAML config")?;
    Ok((cli, cfg))
}
