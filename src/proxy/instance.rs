//! Single-listener proxy instances.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::accept::{accept_worker, AcceptConfig};
use super::dispatch::Dispatcher;
use crate::config::ConnOptions;
use crate::discovery::{HttpRegistry, Registry};
use crate::error::Error;

/// Proxy `opts.from` to a static upstream set.
///
/// Returns a startup error if the listener cannot be opened; otherwise runs
/// until `token` fires, drains the accept source, and returns
/// [`Error::ProxyEnd`].
pub async fn to(token: CancellationToken, opts: ConnOptions) -> Result<(), Error> {
    // Everything this instance starts lives under one scope, so a dispatcher
    // exit on any path tears the accept source down before the drain wait.
    let scope = token.child_token();
    let (conns, accept_stopped) = accept_worker(
        scope.clone(),
        AcceptConfig {
            transport: opts.transport,
            from: opts.from.clone(),
            tls_server: opts.tls.server.clone(),
        },
    )
    .await
    .map_err(Error::Bind)?;

    debug!(from = %opts.from, "static proxy started");
    let initial = opts.to.clone();
    Dispatcher::new(&opts, initial, false)
        .run(scope.clone(), conns, None)
        .await;

    scope.cancel();
    let _ = accept_stopped.await;
    debug!(from = %opts.from, "static proxy stopped");
    Err(Error::ProxyEnd)
}

/// Proxy `opts.from` to upstreams discovered by service key.
///
/// Membership changes tear down every live session so clients never outlive
/// a stale view of the backend.
///
/// # Panics
///
/// Panics when `opts.discovery` is absent; discovery entry points without
/// discovery settings are caller misuse.
pub async fn srv(token: CancellationToken, opts: ConnOptions) -> Result<(), Error> {
    srv_with(token, opts, Arc::new(HttpRegistry::new())).await
}

/// [`srv`] with a caller-supplied registry implementation.
pub async fn srv_with<R: Registry>(
    token: CancellationToken,
    opts: ConnOptions,
    registry: Arc<R>,
) -> Result<(), Error> {
    let disc = opts.discovery.clone().expect("discovery options missing");

    let initial = match registry.obtain(&disc).await {
        Ok(members) => members,
        Err(e) => {
            // Degraded start: refuse connections until the first snapshot.
            warn!(service = %disc.service, error = %e, "initial discovery failed, starting with no upstreams");
            Vec::new()
        }
    };

    let scope = token.child_token();
    let (conns, accept_stopped) = accept_worker(
        scope.clone(),
        AcceptConfig {
            transport: opts.transport,
            from: opts.from.clone(),
            tls_server: opts.tls.server.clone(),
        },
    )
    .await
    .map_err(Error::Bind)?;

    let (nodes, watch_stopped) = registry.watch(scope.clone(), disc);

    debug!(from = %opts.from, "discovery proxy started");
    Dispatcher::new(&opts, initial, true)
        .run(scope.clone(), conns, Some(nodes))
        .await;

    scope.cancel();
    let _ = accept_stopped.await;
    let _ = watch_stopped.await;
    debug!(from = %opts.from, "discovery proxy stopped");
    Err(Error::ProxyEnd)
}
