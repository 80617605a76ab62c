use thiserror::Error;

/// Errors returned by the four entry points (`to`, `srv`, `cluster_to`, `cluster_srv`).
///
/// Every entry point returns exactly once: either a startup/config error, or
/// [`ProxyError::EndOfProxy`] after a clean, cancellation-driven shutdown.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to start proxy")]
    Startup(#[source] anyhow::Error),

    #[error("proxy instance ended")]
    EndOfProxy,
}

impl ProxyError {
    pub fn is_end_of_proxy(&self) -> bool {
        matches!(self, ProxyError::EndOfProxy)
    }
}

/// Non-fatal sizing mismatches in cluster mode. Logged, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterWarning {
    CountMismatch { from_range_len: usize, to_len: usize },
    InsufficientNodes { index: usize },
}

impl std::fmt::Display for ClusterWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterWarning::CountMismatch { from_range_len, to_len } => write!(
                f,
                "from_range has {from_range_len} listen addresses but to has {to_len} upstreams"
            ),
            ClusterWarning::InsufficientNodes { index } => {
                write!(f, "not enough nodes: no upstream for listen index {index}, skipping")
            }
        }
    }
}
