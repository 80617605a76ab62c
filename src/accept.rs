use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Transport, TlsServerConfig};
use crate::tls;
use crate::transport::{AnyListener, BoxedStream};

/// One accepted client connection, already TLS-terminated when inbound TLS
/// is configured.
pub struct Accepted {
    pub stream: BoxedStream,
    pub peer: String,
}

/// Binds a listener for `transport`/`addr` and spawns the accept loop.
///
/// Returns immediately with a bind error if the listener could not be
/// opened. On success, returns a channel of accepted connections and a
/// one-shot signal that fires once the accept loop has fully stopped
/// (either because `token` fired or the listener died).
pub async fn start(
    transport: Transport,
    addr: &str,
    tls_server: Option<&TlsServerConfig>,
    token: CancellationToken,
) -> anyhow::Result<(mpsc::Receiver<Accepted>, oneshot::Receiver<()>)> {
    let listener = AnyListener::bind(transport, addr).await?;
    let server_cfg = tls::build_server_config(tls_server)?.map(Arc::new);

    let (tx, rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = oneshot::channel();

    tokio::spawn(accept_loop(listener, server_cfg, tx, token, stop_tx));

    Ok((rx, stop_rx))
}

async fn accept_loop(
    listener: AnyListener,
    server_cfg: Option<Arc<rustls::ServerConfig>>,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
    stop_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = listener.accept() => {
                let (raw, peer) = match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let tx = tx.clone();
                let server_cfg = server_cfg.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    handle_accepted(raw, peer, server_cfg, tx, token).await;
                });
            }
        }
    }

    debug!("accept loop stopped");
    let _ = stop_tx.send(());
}

/// Completes the inbound TLS handshake (if configured) for one accepted
/// socket before handing it to the dispatcher, so a slow or hostile
/// handshake only blocks its own connection.
async fn handle_accepted(
    raw: BoxedStream,
    peer: String,
    server_cfg: Option<Arc<rustls::ServerConfig>>,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) {
    let stream: BoxedStream = match server_cfg {
        None => raw,
        Some(cfg) => {
            let acceptor = TlsAcceptor::from(cfg);
            let handshake = tokio::select! {
                res = acceptor.accept(raw) => res,
                _ = token.cancelled() => {
                    debug!(%peer, "dropping connection: cancelled during TLS handshake");
                    return;
                }
            };
            match handshake {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    warn!(%peer, error = %e, "inbound TLS handshake failed");
                    return;
                }
            }
        }
    };

    if tx.send(Accepted { stream, peer }).await.is_err() {
        debug!("dispatcher gone, dropping accepted connection");
    }
}
