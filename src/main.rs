//! Binary entry-point for the reverse TCP/TLS proxy.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use relaymesh::config::{self, AppConfig};
use relaymesh::{cluster_srv, cluster_to, srv, to};

/// Maps the `LOG_LEVEL` vocabulary from the ambient spec onto a
/// `tracing_subscriber` filter, defaulting unknown values to `INFO`.
fn map_log_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_uppercase().as_str() {
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" | "FATAL" | "PANIC" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load CLI flags + YAML config ────────────────────────────────────────
    let (cli, cfg) = config::load_config()?;

    // ── 2. Init structured logging (env -> overrides flag) ─────────────────────
    // e.g. RUST_LOG=debug cargo run, or LOG_LEVEL=DEBUG cargo run
    let raw_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| cli.log_level.clone());
    let log_level = map_log_level(&raw_level);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Configuration loaded from {:?}", cli.config);

    // ── 3. Run the selected proxy mode until Ctrl-C ─────────────────────────────
    let root = CancellationToken::new();
    let shutdown = root.clone();

    let mut proxy = tokio::spawn(async move {
        match cfg {
            AppConfig::To(opts) => to(root, opts).await,
            AppConfig::Srv(opts) => srv(root, opts).await,
            AppConfig::ClusterTo(opts) => cluster_to(root, opts).await,
            AppConfig::ClusterSrv(opts) => cluster_srv(root, opts).await,
        }
    });

    let result = tokio::select! {
        res = &mut proxy => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received (Ctrl-C), cancelling proxy");
            shutdown.cancel();
            proxy.await
        }
    };

    match result {
        Ok(err) if err.is_end_of_proxy() => info!("proxy shut down cleanly"),
        Ok(err) => error!("proxy exited with error: {err:?}"),
        Err(join_err) => error!("proxy task panicked: {join_err:?}"),
    }

    Ok(())
}
