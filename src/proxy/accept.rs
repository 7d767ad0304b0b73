//! Accept source: listener bind, accept loop, inbound TLS termination.
//!
//! The worker binds immediately so callers see bind failures as startup
//! errors, then feeds accepted connections into a bounded channel until the
//! cancellation token fires. TLS handshakes run in their own tasks so a slow
//! or stalled handshake never blocks the accept loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{resolve, BoxedConn};
use crate::config::Transport;

/// Accepted connections buffered between the worker and the dispatcher.
const ACCEPT_BACKLOG: usize = 32;

/// Delay before retrying after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What the accept worker listens on.
pub(crate) struct AcceptConfig {
    pub transport: Transport,
    pub from: String,
    pub tls_server: Option<Arc<rustls::ServerConfig>>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, std::path::PathBuf),
}

impl Listener {
    async fn accept(&self) -> io::Result<BoxedConn> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "connection accepted");
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                debug!("unix connection accepted");
                Ok(Box::new(stream))
            }
        }
    }

    fn close(self) {
        #[cfg(unix)]
        if let Listener::Unix(listener, path) = self {
            drop(listener);
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn bind(transport: Transport, from: &str) -> io::Result<Listener> {
    if transport == Transport::Unix {
        return bind_unix(from);
    }
    let mut last = None;
    for addr in resolve(transport, from).await? {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(Listener::Tcp(listener)),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable listen address")
    }))
}

#[cfg(unix)]
fn bind_unix(from: &str) -> io::Result<Listener> {
    let listener = UnixListener::bind(from)?;
    Ok(Listener::Unix(listener, from.into()))
}

#[cfg(not(unix))]
fn bind_unix(_from: &str) -> io::Result<Listener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix transport is not available on this platform",
    ))
}

/// Bind `cfg.from` and start accepting.
///
/// Returns the stream of accepted (and, when configured, TLS-terminated)
/// connections plus a stop signal that fires exactly once after the listener
/// has fully shut down. Bind failures surface immediately.
pub(crate) async fn accept_worker(
    token: CancellationToken,
    cfg: AcceptConfig,
) -> io::Result<(mpsc::Receiver<BoxedConn>, oneshot::Receiver<()>)> {
    let listener = bind(cfg.transport, &cfg.from).await?;
    let acceptor = cfg.tls_server.map(TlsAcceptor::from);
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
    let (stop_tx, stop_rx) = oneshot::channel();

    info!(from = %cfg.from, transport = %cfg.transport, tls = acceptor.is_some(), "listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => match &acceptor {
                        Some(acceptor) => {
                            let acceptor = acceptor.clone();
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(conn).await {
                                    Ok(tls) => {
                                        let _ = tx.send(Box::new(tls) as BoxedConn).await;
                                    }
                                    Err(e) => debug!(error = %e, "inbound TLS handshake failed"),
                                }
                            });
                        }
                        None => {
                            if tx.send(conn).await.is_err() {
                                break;
                            }
                        }
                    },
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
        listener.close();
        let _ = stop_tx.send(());
    });

    Ok((rx, stop_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn bind_failure_surfaces_immediately() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = accept_worker(
            CancellationToken::new(),
            AcceptConfig {
                transport: Transport::Tcp,
                from: addr,
                tls_server: None,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_the_worker_and_fires_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let token = CancellationToken::new();
        let (mut conns, stopped) = accept_worker(
            token.clone(),
            AcceptConfig {
                transport: Transport::Tcp,
                from: addr.clone(),
                tls_server: None,
            },
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let conn = tokio::time::timeout(Duration::from_secs(1), conns.recv())
            .await
            .unwrap();
        assert!(conn.is_some());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), stopped)
            .await
            .expect("stop signal within bound")
            .expect("stop signal fired");
    }
}
