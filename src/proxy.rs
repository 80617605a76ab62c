use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnOptions;
use crate::dispatcher::{self, DispatcherConfig};
use crate::discovery;
use crate::error::ProxyError;
use crate::tls;
use crate::accept;

fn dispatcher_config(opts: &ConnOptions, tls_client: Option<Arc<rustls::ClientConfig>>) -> DispatcherConfig {
    DispatcherConfig {
        transport: opts.transport,
        balance: opts.balance,
        tls_client,
        read_timeout: opts.read_timeout(),
        write_timeout: opts.write_timeout(),
    }
}

/// Static single-listener Proxy Instance.
///
/// Runs until `root` fires, then drains: all session cancellations have
/// been issued and the accept source has reported stop. Always returns —
/// either a startup error, or [`ProxyError::EndOfProxy`] after clean
/// shutdown.
pub async fn to(root: CancellationToken, opts: ConnOptions) -> ProxyError {
    let Some(from) = opts.from.clone() else {
        return ProxyError::Config("to() requires `from` to be set".into());
    };

    let tls_client = match tls::build_client_config(opts.tls_client.as_ref()) {
        Ok(cfg) => cfg.map(Arc::new),
        Err(e) => return ProxyError::Startup(e),
    };

    let (accept_rx, accept_stop) =
        match accept::start(opts.transport, &from, opts.tls_server.as_ref(), root.clone()).await {
            Ok(v) => v,
            Err(e) => return ProxyError::Startup(e),
        };

    info!(%from, to = ?opts.to, balance = opts.balance, "proxy instance starting (static)");

    let cfg = dispatcher_config(&opts, tls_client);
    dispatcher::run(root.clone(), accept_rx, None, opts.to.clone(), cfg).await;

    let _ = accept_stop.await;
    ProxyError::EndOfProxy
}

/// Discovery-driven single-listener Proxy Instance.
///
/// Validates that `opts.discovery` is present (fails loudly otherwise),
/// obtains the initial upstream set (degrading to an empty set with a
/// warning on failure, per the permissive source behavior), then runs the
/// dispatcher against both the accept and discovery streams.
pub async fn srv(root: CancellationToken, opts: ConnOptions) -> ProxyError {
    let Some(disc) = opts.discovery.clone() else {
        return ProxyError::Config("srv() requires `discovery` to be set".into());
    };
    let Some(from) = opts.from.clone() else {
        return ProxyError::Config("srv() requires `from` to be set".into());
    };

    let initial_to = match discovery::obtain(&disc).await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "discovery obtain failed, starting with empty upstream set");
            Vec::new()
        }
    };

    let tls_client = match tls::build_client_config(opts.tls_client.as_ref()) {
        Ok(cfg) => cfg.map(Arc::new),
        Err(e) => return ProxyError::Startup(e),
    };

    let (accept_rx, accept_stop) =
        match accept::start(opts.transport, &from, opts.tls_server.as_ref(), root.clone()).await {
            Ok(v) => v,
            Err(e) => return ProxyError::Startup(e),
        };

    let (discovery_rx, discovery_stop) = discovery::watch(root.clone(), disc);

    info!(%from, initial_count = initial_to.len(), balance = opts.balance, "proxy instance starting (discovery)");

    let cfg = dispatcher_config(&opts, tls_client);
    dispatcher::run(root.clone(), accept_rx, Some(discovery_rx), initial_to, cfg).await;

    let _ = accept_stop.await;
    let _ = discovery_stop.await;
    ProxyError::EndOfProxy
}
