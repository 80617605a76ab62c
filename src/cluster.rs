use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnOptions;
use crate::discovery;
use crate::error::{ClusterWarning, ProxyError};
use crate::proxy;

/// Builds the per-index static `ConnOptions` a cluster instance spawns:
/// one listener (`from_range[i]`) forwarding to one upstream (`to[i]`),
/// inheriting transport, TLS, and timeouts from the cluster-level options.
fn sub_instance_opts(opts: &ConnOptions, from: String, upstream: String) -> ConnOptions {
    ConnOptions {
        transport: opts.transport,
        from: Some(from),
        from_range: Vec::new(),
        to: vec![upstream],
        balance: false,
        tls_server: opts.tls_server.clone(),
        tls_client: opts.tls_client.clone(),
        discovery: None,
        read_timeout_secs: opts.read_timeout_secs,
        write_timeout_secs: opts.write_timeout_secs,
    }
}

fn warn_sizing(from_range: &[String], to: &[String]) {
    if from_range.len() != to.len() {
        warn!(
            "{}",
            ClusterWarning::CountMismatch { from_range_len: from_range.len(), to_len: to.len() }
        );
    }
}

/// Spawns one `to()` instance per `(from_range[i], to[i])` pair under `epoch`,
/// skipping indices with no matching upstream (warned, not fatal). Returns a
/// `JoinSet` yielding `(index, ProxyError)` as each instance terminates.
fn spawn_cohort(epoch: &CancellationToken, opts: &ConnOptions) -> JoinSet<(usize, ProxyError)> {
    warn_sizing(&opts.from_range, &opts.to);

    let mut set = JoinSet::new();
    for (i, from) in opts.from_range.iter().enumerate() {
        let Some(upstream) = opts.to.get(i) else {
            warn!("{}", ClusterWarning::InsufficientNodes { index: i });
            continue;
        };

        let sub_opts = sub_instance_opts(opts, from.clone(), upstream.clone());
        let child = epoch.child_token();
        set.spawn(async move { (i, proxy::to(child, sub_opts).await) });
    }
    set
}

/// Drains `set`, cancelling `epoch` and recording the first non-sentinel
/// error any instance returns (which in turn tears down the rest of the
/// cohort, since every instance's token derives from `epoch`).
async fn join_cohort(epoch: &CancellationToken, mut set: JoinSet<(usize, ProxyError)>) -> Option<ProxyError> {
    let mut first_err = None;
    while let Some(res) = set.join_next().await {
        match res {
            Ok((idx, err)) if !err.is_end_of_proxy() => {
                warn!(index = idx, error = %err, "cluster instance failed to start, tearing down cohort");
                if first_err.is_none() {
                    first_err = Some(err);
                }
                epoch.cancel();
            }
            Ok(_) => {}
            Err(join_err) => warn!(error = %join_err, "cluster instance task panicked"),
        }
    }
    first_err
}

/// Awaits the next snapshot from `rx`, or never resolves when `rx` is `None`
/// (mirrors `dispatcher::recv_optional`: once discovery ends for good, stop
/// selecting on it rather than treating that as equivalent to cancellation).
async fn recv_optional(rx: &mut Option<mpsc::Receiver<Vec<String>>>) -> Option<Vec<String>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Static cluster: one independent Proxy Instance per `(from_range[i], to[i])`
/// pair, all running under `root` until it is cancelled.
pub async fn cluster_to(root: CancellationToken, opts: ConnOptions) -> ProxyError {
    info!(listeners = opts.from_range.len(), upstreams = opts.to.len(), "cluster starting (static)");

    let set = spawn_cohort(&root, &opts);
    if set.is_empty() {
        // No pair had a matching upstream; nothing to join, but the Proxy
        // Instance contract still says "live until root fires".
        root.cancelled().await;
        return ProxyError::EndOfProxy;
    }
    join_cohort(&root, set).await.unwrap_or(ProxyError::EndOfProxy)
}

/// Discovery-driven cluster: recycles the entire per-listener cohort as one
/// generational epoch every time the discovery watch reports a membership
/// change, since each sub-instance is a static `to()` with no channel of its
/// own to receive updates.
pub async fn cluster_srv(root: CancellationToken, opts: ConnOptions) -> ProxyError {
    let Some(disc) = opts.discovery.clone() else {
        return ProxyError::Config("cluster_srv() requires `discovery` to be set".into());
    };

    let mut live_to = match discovery::obtain(&disc).await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "discovery obtain failed, starting with empty upstream set");
            Vec::new()
        }
    };

    let (discovery_rx, discovery_stop) = discovery::watch(root.clone(), disc);
    let mut discovery_rx = Some(discovery_rx);

    info!(listeners = opts.from_range.len(), initial_upstreams = live_to.len(), "cluster starting (discovery)");

    let mut epoch = root.child_token();
    let mut epoch_opts = opts.clone();
    epoch_opts.to = live_to.clone();
    let mut set = spawn_cohort(&epoch, &epoch_opts);

    let result = loop {
        tokio::select! {
            snapshot = recv_optional(&mut discovery_rx) => {
                match snapshot {
                    Some(new_to) => {
                        epoch.cancel();
                        if let Some(err) = join_cohort(&epoch, set).await {
                            break err;
                        }
                        info!(count = new_to.len(), "membership snapshot received, recycling cluster epoch");
                        live_to = new_to;
                        epoch = root.child_token();
                        let mut epoch_opts = opts.clone();
                        epoch_opts.to = live_to.clone();
                        set = spawn_cohort(&epoch, &epoch_opts);
                    }
                    None => {
                        // Discovery stream ended for good without root firing (e.g. no
                        // endpoints configured). The current epoch is still healthy and
                        // serving traffic; stop selecting on discovery rather than
                        // tearing it down, mirroring dispatcher::run's own fallback.
                        discovery_rx = None;
                    }
                }
            }
            _ = root.cancelled() => {
                epoch.cancel();
                if let Some(err) = join_cohort(&epoch, set).await {
                    break err;
                }
                break ProxyError::EndOfProxy;
            }
        }
    };

    let _ = discovery_stop.await;
    result
}
