//! Proxy engine: accept source, dispatcher, forwarding sessions, and the
//! single-listener and cluster entry points.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Accept Source -> Dispatcher -> Session -> Upstream
//!                                ^
//!                       Discovery snapshots
//! ```
//!
//! One cancellation root cascades to every component. In discovery mode a
//! membership snapshot tears down only the live session cohort; the
//! dispatcher itself keeps running.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::lookup_host;

use crate::config::Transport;

mod accept;
mod cluster;
mod dispatch;
mod instance;
mod session;

pub use cluster::{cluster_srv, cluster_srv_with, cluster_to};
pub use instance::{srv, srv_with, to};

/// Byte stream the proxy can forward: plain TCP, TLS-wrapped, or unix.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// An accepted or dialled connection with its concrete type erased.
pub type BoxedConn = Box<dyn Io>;

/// Resolve `addr` to socket addresses matching the transport's family.
pub(crate) async fn resolve(transport: Transport, addr: &str) -> io::Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = lookup_host(addr).await?.collect();
    let matching: Vec<SocketAddr> = match transport {
        Transport::Tcp => resolved,
        Transport::Tcp4 => resolved.into_iter().filter(SocketAddr::is_ipv4).collect(),
        Transport::Tcp6 => resolved.into_iter().filter(SocketAddr::is_ipv6).collect(),
        Transport::Unix => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix transport does not resolve socket addresses",
            ))
        }
    };
    if matching.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{addr} has no address for transport {transport}"),
        ));
    }
    Ok(matching)
}
