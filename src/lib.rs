//! Reverse TCP/TLS proxy with static or discovery-driven upstream membership.
//!
//! `l4relay` accepts client connections on one or more local endpoints and
//! forwards each to one of a set of upstream endpoints, optionally
//! terminating TLS on the listen side and optionally originating TLS toward
//! the upstream. Upstream membership is either a static list or discovered
//! from a registry and watched for changes; on a membership change every
//! in-flight connection is torn down and replaced, so clients never outlive a
//! stale view of the backend.
//!
//! Four entry points, each driven by a [`CancellationToken`] root and a
//! [`ConnOptions`] value:
//!
//! - [`to`] — single listener, static upstreams
//! - [`srv`] — single listener, discovered upstreams
//! - [`cluster_to`] — one listener per upstream, static, positional pairing
//! - [`cluster_srv`] — one listener per upstream, discovered, recycled per
//!   membership epoch
//!
//! Each returns exactly once: a startup error, or [`Error::ProxyEnd`] after a
//! clean shutdown.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use l4relay::{to, ConnOptions};
//!
//! # async fn run() -> Result<(), l4relay::Error> {
//! let root = CancellationToken::new();
//! let opts = ConnOptions {
//!     from: "127.0.0.1:9000".into(),
//!     to: vec!["10.0.0.1:9000".into(), "10.0.0.2:9000".into()],
//!     balance: true,
//!     ..ConnOptions::default()
//! };
//! to(root, opts).await
//! # }
//! ```
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod config;
pub mod discovery;
mod error;
pub mod logging;
mod proxy;

pub use config::{ClientTls, ConnOptions, TlsOptions, Transport};
pub use discovery::{DiscOptions, HttpRegistry, Registry};
pub use error::Error;
pub use proxy::{cluster_srv, cluster_srv_with, cluster_to, srv, srv_with, to, BoxedConn, Io};
