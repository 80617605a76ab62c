use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Transport;
use crate::transport::{dial, host_of, BoxedStream};

const BUF_SIZE: usize = 16 * 1024;

/// Everything a Connection Session needs to drive one accepted client
/// connection to completion; owned for the session's entire lifetime.
pub struct ConnOrder {
    pub client: BoxedStream,
    pub transport: Transport,
    /// The upstream candidate slice visible at dispatch time: either a single
    /// round-robin pick (`balance=true`) or the full live set (`balance=false`).
    pub candidates: Vec<String>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tls_client: Option<Arc<rustls::ClientConfig>>,
}

/// Dials upstreams from `candidates` in order, returning the first that
/// accepts a connection (and, when outbound TLS is configured, completes a
/// handshake). Returns the aggregated dial errors when every candidate fails.
async fn dial_upstream(
    transport: Transport,
    candidates: &[String],
    tls_client: Option<&Arc<rustls::ClientConfig>>,
) -> anyhow::Result<BoxedStream> {
    let mut last_err = None;

    for addr in candidates {
        match dial_one(transport, addr, tls_client).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(upstream = %addr, error = %e, "dial attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no upstream candidates")))
}

async fn dial_one(
    transport: Transport,
    addr: &str,
    tls_client: Option<&Arc<rustls::ClientConfig>>,
) -> anyhow::Result<BoxedStream> {
    let tcp = dial(transport, addr).await?;

    match tls_client {
        None => Ok(tcp),
        Some(cfg) => {
            let connector = TlsConnector::from(cfg.clone());
            let host = host_of(addr)?;
            let server_name = ServerName::try_from(host)
                .map_err(|_| anyhow::anyhow!("invalid server name for upstream {addr:?}"))?
                .to_owned();
            let tls_stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(tls_stream))
        }
    }
}

/// Copies from `reader` to `writer` until EOF or error, applying a fresh
/// deadline to each individual read and write. Returns once the reader hits
/// EOF, propagating any I/O or timeout error otherwise.
async fn pump_direction(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    counter: &AtomicU64,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match read_timeout {
            Some(d) => timeout(d, reader.read(&mut buf))
                .await
                .map_err(|_| anyhow::anyhow!("read timed out after {d:?}"))??,
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(());
        }

        match write_timeout {
            Some(d) => timeout(d, writer.write_all(&buf[..n]))
                .await
                .map_err(|_| anyhow::anyhow!("write timed out after {d:?}"))??,
            None => writer.write_all(&buf[..n]).await?,
        }

        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Drives one [`ConnOrder`] to completion: dials an upstream, then pumps
/// bytes in both directions until either side closes, a timeout fires, or
/// `token` is cancelled. The client connection is closed exactly once.
pub async fn run(order: ConnOrder, token: CancellationToken) {
    let ConnOrder {
        client,
        transport,
        candidates,
        read_timeout,
        write_timeout,
        tls_client,
    } = order;

    if candidates.is_empty() {
        let mut client = client;
        let _ = client.shutdown().await;
        return;
    }

    let mut client = client;

    let dial_result = tokio::select! {
        res = dial_upstream(transport, &candidates, tls_client.as_ref()) => res,
        _ = token.cancelled() => {
            let _ = client.shutdown().await;
            return;
        }
    };

    let upstream = match dial_result {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "failed to connect to upstream");
            let _ = client.shutdown().await;
            return;
        }
    };

    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut up_r, mut up_w) = tokio::io::split(upstream);

    let from_client = AtomicU64::new(0);
    let from_upstream = AtomicU64::new(0);

    let c2u = pump_direction(&mut client_r, &mut up_w, read_timeout, write_timeout, &from_client);
    let u2c = pump_direction(&mut up_r, &mut client_w, read_timeout, write_timeout, &from_upstream);
    tokio::pin!(c2u);
    tokio::pin!(u2c);

    tokio::select! {
        res = &mut c2u => {
            if let Err(e) = res {
                debug!(error = %e, "client->upstream pump ended");
            }
        }
        res = &mut u2c => {
            if let Err(e) = res {
                debug!(error = %e, "upstream->client pump ended");
            }
        }
        _ = token.cancelled() => {
            debug!("session cancelled by membership change or shutdown");
        }
    }

    let _ = client_w.shutdown().await;
    let _ = up_w.shutdown().await;

    info!(
        from_client = from_client.load(Ordering::Relaxed),
        from_upstream = from_upstream.load(Ordering::Relaxed),
        "session closed"
    );
}
