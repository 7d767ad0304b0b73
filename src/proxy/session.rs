//! A single forwarding session: upstream dial, outbound TLS, byte pumping.
//!
//! A session owns exactly one accepted client connection for its whole
//! lifetime. It ends at the first of: either side closing, a timeout firing,
//! or its cancellation token firing. Every exit path closes both streams by
//! dropping them.

use std::io;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{resolve, BoxedConn};
use crate::config::{ClientTls, Transport};

const COPY_BUF_SIZE: usize = 8192;

/// Everything a session owns: the client connection, the upstream candidates
/// frozen at dispatch time, and the forwarding parameters.
pub(crate) struct ConnOrder {
    pub conn: BoxedConn,
    pub transport: Transport,
    pub candidates: Vec<String>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tls_client: Option<ClientTls>,
}

/// Drive one client connection to completion against one chosen upstream.
pub(crate) async fn handle_conn(token: CancellationToken, order: ConnOrder) {
    let ConnOrder {
        conn: client,
        transport,
        candidates,
        read_timeout,
        write_timeout,
        tls_client,
    } = order;

    let upstream = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("session cancelled before upstream dial");
            return;
        }
        dialled = dial_first(transport, &candidates, &tls_client) => match dialled {
            Some(upstream) => upstream,
            None => {
                debug!(?candidates, "no upstream reachable, closing client");
                return;
            }
        }
    };

    pump(client, upstream, read_timeout, write_timeout, token).await;
}

/// Dial candidates in order; the first successful dial wins. A candidate that
/// fails to dial or to complete its TLS handshake is skipped, never retried.
async fn dial_first(
    transport: Transport,
    candidates: &[String],
    tls: &Option<ClientTls>,
) -> Option<BoxedConn> {
    for addr in candidates {
        match dial(transport, addr).await {
            Ok(stream) => match wrap_tls(stream, addr, tls).await {
                Ok(upstream) => {
                    debug!(upstream = %addr, "upstream connected");
                    return Some(upstream);
                }
                Err(e) => debug!(upstream = %addr, error = %e, "outbound TLS handshake failed"),
            },
            Err(e) => debug!(upstream = %addr, error = %e, "upstream dial failed"),
        }
    }
    None
}

async fn dial(transport: Transport, addr: &str) -> io::Result<BoxedConn> {
    if transport == Transport::Unix {
        return dial_unix(addr).await;
    }
    let mut last = None;
    for resolved in resolve(transport, addr).await? {
        match TcpStream::connect(resolved).await {
            Ok(stream) => return Ok(Box::new(stream)),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable upstream address")
    }))
}

#[cfg(unix)]
async fn dial_unix(addr: &str) -> io::Result<BoxedConn> {
    Ok(Box::new(UnixStream::connect(addr).await?))
}

#[cfg(not(unix))]
async fn dial_unix(_addr: &str) -> io::Result<BoxedConn> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix transport is not available on this platform",
    ))
}

async fn wrap_tls(
    stream: BoxedConn,
    addr: &str,
    tls: &Option<ClientTls>,
) -> io::Result<BoxedConn> {
    let Some(tls) = tls else {
        return Ok(stream);
    };
    let name = tls
        .server_name
        .clone()
        .unwrap_or_else(|| host_of(addr).to_string());
    let server_name = ServerName::try_from(name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let connector = TlsConnector::from(tls.config.clone());
    let wrapped = connector.connect(server_name, stream).await?;
    Ok(Box::new(wrapped))
}

/// Host portion of a `host:port` address, with IPv6 brackets stripped.
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    }
}

/// Pump bytes both ways until either direction finishes, a deadline fires, or
/// the session is cancelled. Dropping the halves on return closes both
/// streams exactly once.
async fn pump(
    client: BoxedConn,
    upstream: BoxedConn,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    token: CancellationToken,
) {
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("session cancelled");
        }
        res = copy_half(client_read, upstream_write, read_timeout, write_timeout) => {
            finish("client to upstream", res);
        }
        res = copy_half(upstream_read, client_write, read_timeout, write_timeout) => {
            finish("upstream to client", res);
        }
    }
}

fn finish(direction: &'static str, res: io::Result<u64>) {
    match res {
        Ok(bytes) => debug!(direction, bytes, "session closed"),
        Err(e) => debug!(direction, error = %e, "session ended with error"),
    }
}

/// Copy until EOF, applying a fresh deadline to every read and every write.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match read_timeout {
            Some(limit) => timeout(limit, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??,
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }
        match write_timeout {
            Some(limit) => timeout(limit, writer.write_all(&buf[..n]))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))??,
            None => writer.write_all(&buf[..n]).await?,
        }
        total += n as u64;
    }
    writer.shutdown().await.ok();
    Ok(total)
}
