
use std::time::Duration;

use harness::{connect_when_ready, free_addr, TcpEchoBackend};
use l4relay::{to, ConnOptions, Error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn forwards_bytes_and_returns_proxy_end_on_cancel() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let from = free_addr().await;

    let token = CancellationToken::new();
    let opts = ConnOptions {
        from: from.clone(),
        to: vec![backend.addr.to_string()],
        ..ConnOptions::default()
    };
    let proxy = tokio::spawn(to(token.clone(), opts));

    let mut client = connect_when_ready(&from).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // The stream stays open for further exchanges in both directions.
    client.write_all(b"more data").await.unwrap();
    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"more data");

    assert_eq!(backend.connection_count(), 1);

    token.cancel();
    let result = timeout(Duration::from_secs(1), proxy)
        .await
        .expect("entry point returns promptly after cancel")
        .unwrap();
    assert!(matches!(result, Err(Error::ProxyEnd)));
}

#[tokio::test]
async fn cancelling_twice_is_harmless() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let from = free_addr().await;

    let token = CancellationToken::new();
    let opts = ConnOptions {
        from: from.clone(),
        to: vec![backend.addr.to_string()],
        ..ConnOptions::default()
    };
    let proxy = tokio::spawn(to(token.clone(), opts));
    connect_when_ready(&from).await.unwrap();

    token.cancel();
    token.cancel();
    let result = timeout(Duration::from_secs(1), proxy).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::ProxyEnd)));
}

#[tokio::test]
async fn bind_failure_is_a_startup_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let from = taken.local_addr().unwrap().to_string();

    let opts = ConnOptions {
        from,
        to: vec!["127.0.0.1:1".to_string()],
        ..ConnOptions::default()
    };
    let result = to(CancellationToken::new(), opts).await;
    assert!(matches!(result, Err(Error::Bind(_))));
}

#[tokio::test]
async fn empty_static_upstreams_refuse_connections() {
    let from = free_addr().await;

    let token = CancellationToken::new();
    let opts = ConnOptions {
        from: from.clone(),
        to: Vec::new(),
        ..ConnOptions::default()
    };
    let _proxy = tokio::spawn(to(token.clone(), opts));

    let mut client = connect_when_ready(&from).await.unwrap();
    client.write_all(b"anyone there").await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), client.read(&mut buf))
        .await
        .expect("refusal happens promptly")
        .unwrap_or(0);
    assert_eq!(n, 0, "connection should close without data");

    token.cancel();
}
