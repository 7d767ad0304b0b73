//! Cluster supervisors: one independent proxy instance per listen/upstream
//! pair, composed under a single cancellation root.
//!
//! Pairing is positional. Listeners without an upstream candidate are skipped
//! with a warning rather than failing the whole cluster. In discovery mode
//! the entire instance cohort is recycled as one epoch whenever membership
//! changes; each sub-instance is static and has no channel for live updates,
//! so generational restart is the simple correct policy at low change rates.

use std::future::pending;
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::instance;
use crate::config::ConnOptions;
use crate::discovery::{HttpRegistry, Registry};
use crate::error::Error;

/// Proxy each address in `opts.from_range` to the matching `opts.to` entry.
///
/// An instance failing at startup (for example a listener that cannot bind)
/// cancels its siblings and surfaces that error; otherwise the supervisor
/// runs until `token` fires and returns [`Error::ProxyEnd`].
pub async fn cluster_to(token: CancellationToken, opts: ConnOptions) -> Result<(), Error> {
    warn_on_mismatch("cluster_to", &opts.from_range, &opts.to);

    let supervisor = token.child_token();
    let mut instances = JoinSet::new();
    spawn_instances(&mut instances, &supervisor, &opts, &opts.to);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            finished = instances.join_next(), if !instances.is_empty() => {
                if let Some(startup) = startup_failure(finished) {
                    supervisor.cancel();
                    drain(&mut instances).await;
                    return Err(startup);
                }
            }
        }
    }

    drain(&mut instances).await;
    Err(Error::ProxyEnd)
}

/// Cluster variant of [`instance::srv`]: discovered membership pairs
/// positionally with `opts.from_range`, and every membership change recycles
/// the whole instance cohort as a new epoch.
///
/// # Panics
///
/// Panics when `opts.discovery` is absent; discovery entry points without
/// discovery settings are caller misuse.
pub async fn cluster_srv(token: CancellationToken, opts: ConnOptions) -> Result<(), Error> {
    cluster_srv_with(token, opts, Arc::new(HttpRegistry::new())).await
}

/// [`cluster_srv`] with a caller-supplied registry implementation.
pub async fn cluster_srv_with<R: Registry>(
    token: CancellationToken,
    opts: ConnOptions,
    registry: Arc<R>,
) -> Result<(), Error> {
    let disc = opts.discovery.clone().expect("discovery options missing");

    let mut targets = match registry.obtain(&disc).await {
        Ok(members) => members,
        Err(e) => {
            warn!(service = %disc.service, error = %e, "initial discovery failed, starting with no upstreams");
            Vec::new()
        }
    };
    warn_on_mismatch("cluster_srv", &opts.from_range, &targets);

    let watch_scope = token.child_token();
    let (nodes, watch_stopped) = registry.watch(watch_scope.clone(), disc);
    let mut nodes = Some(nodes);

    let result = loop {
        let epoch = token.child_token();
        let mut instances = JoinSet::new();
        spawn_instances(&mut instances, &epoch, &opts, &targets);

        let outcome = loop {
            let next_snapshot = async {
                match nodes.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break EpochOutcome::Shutdown,
                snapshot = next_snapshot => match snapshot {
                    Some(members) => break EpochOutcome::Recycle(members),
                    // Watch ended; run the current epoch until root cancel.
                    None => nodes = None,
                },
                finished = instances.join_next(), if !instances.is_empty() => {
                    if let Some(startup) = startup_failure(finished) {
                        break EpochOutcome::Fail(startup);
                    }
                }
            }
        };

        epoch.cancel();
        drain(&mut instances).await;

        match outcome {
            EpochOutcome::Shutdown => break Ok(()),
            EpochOutcome::Fail(err) => break Err(err),
            EpochOutcome::Recycle(members) => {
                info!(targets = ?members, "membership changed, starting new cluster epoch");
                targets = members;
            }
        }
    };

    watch_scope.cancel();
    let _ = watch_stopped.await;

    result?;
    Err(Error::ProxyEnd)
}

enum EpochOutcome {
    Shutdown,
    Recycle(Vec<String>),
    Fail(Error),
}

fn warn_on_mismatch(entry: &str, from_range: &[String], targets: &[String]) {
    if from_range.len() != targets.len() {
        warn!(
            entry,
            sources = from_range.len(),
            targets = targets.len(),
            err = %Error::ClusterNodeMismatch,
            "cluster sizing mismatch"
        );
    }
}

/// Spawn one static instance per pairable index under `parent`.
fn spawn_instances(
    instances: &mut JoinSet<Result<(), Error>>,
    parent: &CancellationToken,
    opts: &ConnOptions,
    targets: &[String],
) {
    for (idx, from) in opts.from_range.iter().enumerate() {
        let Some(target) = targets.get(idx) else {
            warn!(
                index = idx,
                from = %from,
                err = %Error::ClusterNotEnoughNodes,
                "skipping listener without an upstream candidate"
            );
            continue;
        };
        let child = ConnOptions {
            transport: opts.transport,
            from: from.clone(),
            from_range: Vec::new(),
            to: vec![target.clone()],
            balance: false,
            tls: opts.tls.clone(),
            discovery: None,
            read_timeout: opts.read_timeout,
            write_timeout: opts.write_timeout,
        };
        debug!(from = %child.from, to = %target, "starting cluster instance");
        instances.spawn(instance::to(parent.child_token(), child));
    }
}

/// Classify an instance exit: `Some` only for a real startup failure.
fn startup_failure(finished: Option<Result<Result<(), Error>, JoinError>>) -> Option<Error> {
    match finished {
        None => None,
        Some(Ok(Err(Error::ProxyEnd))) | Some(Ok(Ok(()))) => None,
        Some(Ok(Err(startup))) => {
            error!(error = %startup, "cluster instance failed to start");
            Some(startup)
        }
        Some(Err(join)) => {
            error!(error = %join, "cluster instance aborted");
            None
        }
    }
}

async fn drain(instances: &mut JoinSet<Result<(), Error>>) {
    while instances.join_next().await.is_some() {}
}
