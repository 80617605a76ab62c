use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::config::Transport;

/// A duplex byte stream, erased over its concrete transport/TLS layering so
/// the dispatcher and session pump never need to know whether a given side
/// is a raw TCP/Unix socket or a TLS stream wrapping one.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A listener bound for one of the four [`Transport`] kinds.
pub enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AnyListener {
    pub async fn bind(transport: Transport, addr: &str) -> anyhow::Result<Self> {
        match transport {
            Transport::Tcp => Ok(AnyListener::Tcp(TcpListener::bind(addr).await?)),
            Transport::Tcp4 => {
                let resolved = resolve_v4(addr)?;
                Ok(AnyListener::Tcp(TcpListener::bind(resolved).await?))
            }
            Transport::Tcp6 => {
                let resolved = resolve_v6(addr)?;
                Ok(AnyListener::Tcp(TcpListener::bind(resolved).await?))
            }
            Transport::Unix => {
                // Binding twice to the same path fails; a stale socket file
                // from a previous crash is removed first.
                let _ = std::fs::remove_file(addr);
                Ok(AnyListener::Unix(UnixListener::bind(addr)?))
            }
        }
    }

    pub async fn accept(&self) -> anyhow::Result<(BoxedStream, String)> {
        match self {
            AnyListener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            AnyListener::Unix(l) => {
                let (stream, _addr) = l.accept().await?;
                Ok((Box::new(stream), "unix-peer".to_string()))
            }
        }
    }
}

/// Dials one upstream candidate using the configured transport.
pub async fn dial(transport: Transport, addr: &str) -> anyhow::Result<BoxedStream> {
    match transport {
        Transport::Tcp => Ok(Box::new(TcpStream::connect(addr).await?)),
        Transport::Tcp4 => Ok(Box::new(TcpStream::connect(resolve_v4(addr)?).await?)),
        Transport::Tcp6 => Ok(Box::new(TcpStream::connect(resolve_v6(addr)?).await?)),
        Transport::Unix => Ok(Box::new(UnixStream::connect(addr).await?)),
    }
}

fn resolve_v4(addr: &str) -> anyhow::Result<SocketAddr> {
    let sa: SocketAddr = addr.parse()?;
    match sa.ip() {
        std::net::IpAddr::V4(_) => Ok(sa),
        std::net::IpAddr::V6(_) => anyhow::bail!("{addr} is not an IPv4 address but transport=tcp4"),
    }
}

fn resolve_v6(addr: &str) -> anyhow::Result<SocketAddr> {
    let sa: SocketAddr = addr.parse()?;
    match sa.ip() {
        std::net::IpAddr::V6(_) => Ok(sa),
        std::net::IpAddr::V4(v4) => {
            // Accept a bare IPv4 literal under tcp6 by mapping it, mirroring
            // how dual-stack listeners are commonly configured.
            Ok(SocketAddr::new(std::net::IpAddr::V6(v4.to_ipv6_mapped()), sa.port()))
        }
    }
}

/// Extracts the bare host portion of a `host:port` upstream address, used as
/// the SNI/certificate-verification name when dialing with outbound TLS.
pub fn host_of(addr: &str) -> anyhow::Result<String> {
    addr.rsplit_once(':')
        .map(|(host, _port)| host.to_string())
        .ok_or_else(|| anyhow::anyhow!("invalid upstream address {addr:?}, expected host:port"))
}
