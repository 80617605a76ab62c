//! Reverse TCP/TLS proxy library: accepts client connections on one or more
//! local endpoints and forwards each to one of a set of upstream endpoints,
//! optionally terminating TLS on the listen side and optionally originating
//! TLS toward the upstream. Upstream membership is either static or obtained
//! from an external discovery registry with live membership updates.
//!
//! Four entry points, each taking a [`tokio_util::sync::CancellationToken`]
//! cancellation root and a [`config::ConnOptions`] value:
//!
//! - [`to`] — static single-listener.
//! - [`srv`] — discovery-driven single-listener.
//! - [`cluster_to`] — static cluster of independent instances.
//! - [`cluster_srv`] — discovery-driven cluster, recycled as a whole on
//!   every membership change.

pub mod accept;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod session;
pub mod tls;
pub mod transport;

mod proxy;

pub use cluster::{cluster_srv, cluster_to};
pub use config::{ConnOptions, DiscOptions, Transport, TlsClientConfig, TlsServerConfig};
pub use error::{ClusterWarning, ProxyError};
pub use proxy::{srv, to};
