//! Library error types.

use std::io;

use thiserror::Error;

/// Errors surfaced by the proxy entry points.
///
/// Entry points return exactly once: either a startup error, or
/// [`Error::ProxyEnd`] once the instance has drained after cancellation.
#[derive(Debug, Error)]
pub enum Error {
    /// The proxy instance shut down cleanly. This is the terminal sentinel,
    /// not a failure.
    #[error("proxy end")]
    ProxyEnd,

    /// The listener could not be opened.
    #[error("failed to bind listener")]
    Bind(#[source] io::Error),

    /// Cluster mode was asked to pair listen and upstream addresses, but the
    /// counts differ. Warning-only: excess entries on either side are skipped.
    #[error("origin and target count mismatch")]
    ClusterNodeMismatch,

    /// A cluster listener index has no upstream candidate to pair with.
    /// Warning-only: the listener is skipped.
    #[error("candidate less than asked")]
    ClusterNotEnoughNodes,

    /// A discovery registry request failed.
    #[error("discovery: {0}")]
    Discovery(String),
}

impl Error {
    /// True for the clean-shutdown sentinel.
    pub fn is_proxy_end(&self) -> bool {
        matches!(self, Error::ProxyEnd)
    }
}
