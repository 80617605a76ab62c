use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::accept::Accepted;
use crate::config::Transport;
use crate::session::{self, ConnOrder};

/// Settings the dispatcher applies to every session it spawns; constant for
/// the lifetime of one Proxy Instance.
#[derive(Clone)]
pub struct DispatcherConfig {
    pub transport: Transport,
    pub balance: bool,
    pub tls_client: Option<Arc<rustls::ClientConfig>>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Runs the single-threaded dispatch loop until `root` is cancelled or the
/// accept stream ends. `discovery_rx` is `Some` in discovery mode; its
/// presence both enables membership-driven cohort recycling and selects
/// whether session cancellation handles are tracked at all (static mode
/// never mutates `to`, so there is nothing to recycle).
///
/// `to` is the initial upstream set, owned by the dispatcher from here on.
pub async fn run(
    root: CancellationToken,
    mut accept_rx: mpsc::Receiver<Accepted>,
    mut discovery_rx: Option<mpsc::Receiver<Vec<String>>>,
    mut to: Vec<String>,
    cfg: DispatcherConfig,
) {
    let discovery_mode = discovery_rx.is_some();
    let mut cohort: Vec<CancellationToken> = Vec::new();
    let mut cursor: usize = 0;

    loop {
        tokio::select! {
            biased;

            _ = root.cancelled() => {
                break;
            }

            snapshot = recv_optional(&mut discovery_rx) => {
                match snapshot {
                    Some(new_to) => {
                        info!(count = new_to.len(), "membership snapshot received, recycling cohort");
                        to = new_to;
                        for handle in cohort.drain(..) {
                            handle.cancel();
                        }
                        cursor = 0;
                    }
                    None => {
                        // Discovery stream closed for good; stop selecting on it.
                        discovery_rx = None;
                    }
                }
            }

            accepted = accept_rx.recv() => {
                let Some(accepted) = accepted else {
                    break;
                };
                dispatch(
                    accepted,
                    &mut to,
                    &mut cursor,
                    &mut cohort,
                    discovery_mode,
                    &root,
                    &cfg,
                );
            }
        }
    }
}

fn dispatch(
    accepted: Accepted,
    to: &mut [String],
    cursor: &mut usize,
    cohort: &mut Vec<CancellationToken>,
    discovery_mode: bool,
    root: &CancellationToken,
    cfg: &DispatcherConfig,
) {
    if to.is_empty() {
        tokio::spawn(close_quietly(accepted));
        return;
    }

    let candidates = if cfg.balance {
        let addr = to[*cursor % to.len()].clone();
        *cursor = (*cursor + 1) % to.len();
        vec![addr]
    } else {
        to.to_vec()
    };

    let token = root.child_token();
    if discovery_mode {
        cohort.push(token.clone());
    }

    let order = ConnOrder {
        client: accepted.stream,
        transport: cfg.transport,
        candidates,
        read_timeout: cfg.read_timeout,
        write_timeout: cfg.write_timeout,
        tls_client: cfg.tls_client.clone(),
    };

    tokio::spawn(session::run(order, token));
}

async fn close_quietly(accepted: Accepted) {
    let mut stream = accepted.stream;
    let _ = stream.shutdown().await;
}

/// Awaits the next snapshot from `rx`, or never resolves when `rx` is `None`
/// (static mode has no discovery stream to select over).
async fn recv_optional(rx: &mut Option<mpsc::Receiver<Vec<String>>>) -> Option<Vec<String>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
