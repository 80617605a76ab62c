use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DiscOptions;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct WatchResponse {
    index: u64,
    nodes: Vec<String>,
}

/// One-shot fetch of the current upstream set. Tries each configured
/// endpoint in order, returning the first successful response.
pub async fn obtain(opts: &DiscOptions) -> anyhow::Result<Vec<String>> {
    let client = reqwest::Client::new();
    let mut last_err = None;

    for endpoint in &opts.endpoints {
        let url = format!("{}/v1/watch/{}?after=0", endpoint.trim_end_matches('/'), opts.service);
        match client.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json::<WatchResponse>().await {
                    Ok(body) => return Ok(body.nodes),
                    Err(e) => last_err = Some(anyhow::Error::from(e)),
                },
                Err(e) => last_err = Some(anyhow::Error::from(e)),
            },
            Err(e) => last_err = Some(anyhow::Error::from(e)),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no discovery endpoints configured")))
}

/// Long-running membership watch. Produces a complete snapshot every time
/// the registry reports a change, and a one-shot signal once the watch loop
/// has fully released its resources (on `token` cancellation).
pub fn watch(
    token: CancellationToken,
    opts: DiscOptions,
) -> (mpsc::Receiver<Vec<String>>, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = oneshot::channel();

    tokio::spawn(watch_loop(token, opts, tx, stop_tx));

    (rx, stop_rx)
}

async fn watch_loop(
    token: CancellationToken,
    opts: DiscOptions,
    tx: mpsc::Sender<Vec<String>>,
    stop_tx: oneshot::Sender<()>,
) {
    let client = reqwest::Client::new();
    let mut cursor = opts.after_index;
    let mut endpoint_idx = 0usize;

    loop {
        if opts.endpoints.is_empty() {
            break;
        }

        let endpoint = &opts.endpoints[endpoint_idx % opts.endpoints.len()];
        let url = format!(
            "{}/v1/watch/{}?after={}",
            endpoint.trim_end_matches('/'),
            opts.service,
            cursor
        );

        let request = client.get(&url).send();
        tokio::pin!(request);

        let response = tokio::select! {
            res = &mut request => res,
            _ = token.cancelled() => break,
        };

        match response.and_then(|r| r.error_for_status()) {
            Ok(resp) => match resp.json::<WatchResponse>().await {
                Ok(body) => {
                    cursor = body.index;
                    if tx.send(body.nodes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "discovery watch: malformed response");
                    endpoint_idx = endpoint_idx.wrapping_add(1);
                    if wait_or_cancelled(&token, RETRY_BACKOFF).await {
                        break;
                    }
                }
            },
            Err(e) => {
                warn!(error = %e, endpoint = %endpoint, "discovery watch: request failed");
                endpoint_idx = endpoint_idx.wrapping_add(1);
                if wait_or_cancelled(&token, RETRY_BACKOFF).await {
                    break;
                }
            }
        }
    }

    debug!("discovery watch stopped");
    let _ = stop_tx.send(());
}

/// Waits out a backoff, returning early (with `true`) if `token` fires first.
async fn wait_or_cancelled(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = token.cancelled() => true,
    }
}
