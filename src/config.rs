//! Proxy configuration types.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::DiscOptions;

/// Socket family and kind used for both the listen and the dial side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// TCP over either address family.
    #[default]
    Tcp,
    /// TCP restricted to IPv4 addresses.
    Tcp4,
    /// TCP restricted to IPv6 addresses.
    Tcp6,
    /// Unix domain stream sockets.
    Unix,
}

/// Error returned when parsing an unrecognized transport name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTransport(String);

impl fmt::Display for UnknownTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown transport {:?}", self.0)
    }
}

impl std::error::Error for UnknownTransport {}

impl FromStr for Transport {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "tcp4" => Ok(Transport::Tcp4),
            "tcp6" => Ok(Transport::Tcp6),
            "unix" => Ok(Transport::Unix),
            other => Err(UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Tcp => "tcp",
            Transport::Tcp4 => "tcp4",
            Transport::Tcp6 => "tcp6",
            Transport::Unix => "unix",
        };
        f.write_str(name)
    }
}

/// TLS parameters for the dial side.
#[derive(Clone)]
pub struct ClientTls {
    /// Client configuration used to wrap upstream connections.
    pub config: Arc<rustls::ClientConfig>,
    /// SNI name presented to the upstream. Derived from the upstream address
    /// host when unset.
    pub server_name: Option<String>,
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Inbound and outbound TLS configuration.
///
/// A present `server` config terminates TLS on accepted connections; a present
/// `client` config originates TLS toward the upstream. Both default to off.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Terminates inbound TLS when present.
    pub server: Option<Arc<rustls::ServerConfig>>,
    /// Originates outbound TLS when present.
    pub client: Option<ClientTls>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

/// How a proxy instance listens and forwards.
///
/// Immutable input to the entry points. In discovery modes the live upstream
/// set evolves inside the dispatcher; the caller's `to` field only seeds it.
#[derive(Debug, Clone, Default)]
pub struct ConnOptions {
    /// Transport for both listen and dial.
    pub transport: Transport,
    /// Listen address for the single-listener entry points.
    pub from: String,
    /// Listen addresses for the cluster entry points, paired positionally
    /// with `to`.
    pub from_range: Vec<String>,
    /// Upstream addresses: the full static set, or the initial set in
    /// discovery modes.
    pub to: Vec<String>,
    /// Round-robin one upstream per connection instead of handing each
    /// session the full candidate list.
    pub balance: bool,
    /// TLS termination and origination.
    pub tls: TlsOptions,
    /// Discovery registry settings; presence switches the `srv` entry points
    /// from static to discovered membership.
    pub discovery: Option<DiscOptions>,
    /// Per-read deadline inside a session, refreshed on every successful read.
    pub read_timeout: Option<Duration>,
    /// Per-write deadline inside a session, refreshed on every successful write.
    pub write_timeout: Option<Duration>,
}
