//! Dispatcher: the per-instance event loop owning upstream membership and the
//! live session cohort.
//!
//! The dispatcher is the only task that reads or writes the upstream list;
//! sessions receive an owned copy frozen at dispatch time. On a membership
//! snapshot, every session dispatched under the previous list is cancelled
//! before any session runs under the new one.

use std::future::pending;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{handle_conn, ConnOrder};
use super::BoxedConn;
use crate::config::{ClientTls, ConnOptions, Transport};

pub(crate) struct Dispatcher {
    transport: Transport,
    to: Vec<String>,
    balance: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    tls_client: Option<ClientTls>,
    /// Cancellation handles for sessions of the current membership epoch.
    /// Only tracked when membership can change.
    cohort: Vec<CancellationToken>,
    track_cohort: bool,
    /// Round-robin cursor, used only in balance mode.
    cursor: usize,
}

impl Dispatcher {
    /// Build a dispatcher from instance options and the initial upstream set.
    ///
    /// `track_cohort` is set in discovery mode, where membership snapshots
    /// must be able to tear down every live session.
    pub(crate) fn new(opts: &ConnOptions, to: Vec<String>, track_cohort: bool) -> Self {
        Self {
            transport: opts.transport,
            to,
            balance: opts.balance,
            read_timeout: opts.read_timeout,
            write_timeout: opts.write_timeout,
            tls_client: opts.tls.client.clone(),
            cohort: Vec::new(),
            track_cohort,
            cursor: 0,
        }
    }

    /// Run until the token fires or the accept stream closes.
    ///
    /// Cancellation wins over pending work. Outstanding sessions are not
    /// awaited here: their tokens derive from `token`, so root cancellation
    /// has already reached them.
    pub(crate) async fn run(
        mut self,
        token: CancellationToken,
        mut conns: mpsc::Receiver<BoxedConn>,
        mut nodes: Option<mpsc::Receiver<Vec<String>>>,
    ) {
        loop {
            let next_snapshot = async {
                match nodes.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                snapshot = next_snapshot => match snapshot {
                    Some(members) => self.adopt(members),
                    // Watch ended; keep serving the last known view.
                    None => nodes = None,
                },
                conn = conns.recv() => match conn {
                    Some(conn) => self.dispatch(conn, &token),
                    // Accept source gone.
                    None => break,
                },
            }
        }
    }

    /// Replace the upstream set and recycle the live cohort.
    fn adopt(&mut self, members: Vec<String>) {
        info!(members = ?members, "upstream set replaced, recycling sessions");
        self.to = members;
        for session in self.cohort.drain(..) {
            session.cancel();
        }
        self.cursor = 0;
    }

    /// Spawn a session for one accepted connection, or refuse it when no
    /// upstream is known.
    fn dispatch(&mut self, conn: BoxedConn, token: &CancellationToken) {
        if self.to.is_empty() {
            debug!("no upstream candidates, refusing connection");
            return;
        }

        let candidates = if self.balance {
            if self.cursor >= self.to.len() {
                self.cursor = 0;
            }
            let pick = vec![self.to[self.cursor].clone()];
            self.cursor = (self.cursor + 1) % self.to.len();
            pick
        } else {
            self.to.clone()
        };

        let session = token.child_token();
        let order = ConnOrder {
            conn,
            transport: self.transport,
            candidates,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            tls_client: self.tls_client.clone(),
        };
        tokio::spawn(handle_conn(session.clone(), order));

        if self.track_cohort {
            // TODO: prune finished sessions here instead of waiting for the
            // next membership snapshot to drain the whole cohort.
            self.cohort.push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> BoxedConn {
        let (near, _far) = tokio::io::duplex(8);
        // The far half drops immediately; the session will fail its dial and
        // close the near half, which is all these tests need.
        Box::new(near)
    }

    fn dispatcher(to: &[&str], balance: bool, track: bool) -> Dispatcher {
        let opts = ConnOptions {
            balance,
            ..ConnOptions::default()
        };
        Dispatcher::new(&opts, to.iter().map(|s| s.to_string()).collect(), track)
    }

    #[tokio::test]
    async fn balance_mode_walks_candidates_round_robin() {
        let mut d = dispatcher(&["a:1", "b:1", "c:1"], true, false);
        let token = CancellationToken::new();

        let mut picks = Vec::new();
        for _ in 0..6 {
            if d.cursor >= d.to.len() {
                d.cursor = 0;
            }
            picks.push(d.to[d.cursor].clone());
            d.dispatch(test_conn(), &token);
        }
        assert_eq!(picks, ["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[tokio::test]
    async fn adopt_cancels_the_previous_cohort_and_resets_the_cursor() {
        let mut d = dispatcher(&["a:1", "b:1"], true, true);
        let token = CancellationToken::new();

        d.dispatch(test_conn(), &token);
        d.dispatch(test_conn(), &token);
        assert_eq!(d.cohort.len(), 2);
        let previous: Vec<_> = d.cohort.clone();

        d.adopt(vec!["c:1".to_string()]);
        assert!(previous.iter().all(|t| t.is_cancelled()));
        assert!(d.cohort.is_empty());
        assert_eq!(d.cursor, 0);
        assert_eq!(d.to, ["c:1"]);
    }

    #[tokio::test]
    async fn cursor_resets_when_the_set_shrinks() {
        let mut d = dispatcher(&["a:1", "b:1", "c:1"], true, true);
        let token = CancellationToken::new();

        d.dispatch(test_conn(), &token);
        d.dispatch(test_conn(), &token);
        assert_eq!(d.cursor, 2);

        d.to = vec!["a:1".to_string(), "b:1".to_string()];
        d.dispatch(test_conn(), &token);
        assert_eq!(d.cursor, 1);
    }

    #[tokio::test]
    async fn empty_set_refuses_without_registering_a_session() {
        let mut d = dispatcher(&[], false, true);
        let token = CancellationToken::new();

        d.dispatch(test_conn(), &token);
        assert!(d.cohort.is_empty());
    }

    #[tokio::test]
    async fn static_mode_does_not_accumulate_cohort_entries() {
        let mut d = dispatcher(&["a:1"], false, false);
        let token = CancellationToken::new();

        for _ in 0..8 {
            d.dispatch(test_conn(), &token);
        }
        assert!(d.cohort.is_empty());
    }
}
