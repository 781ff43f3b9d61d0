//! End-to-end tests over real TCP sockets

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_test::assert_ok;

use common::{eventually, settings};
use tunnel_relay::metrics::RelayMetrics;
use tunnel_relay::transport::{build_dialer, AcceptMode, TcpAcceptor};
use tunnel_relay::Supervisor;

async fn start(
    mode: AcceptMode,
    target: &str,
) -> (Arc<Supervisor>, Arc<TcpAcceptor>, Arc<RelayMetrics>, tokio::task::JoinHandle<()>) {
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let relay_settings = settings(Duration::from_secs(2), Duration::from_millis(100));
    let dialer = build_dialer(target, relay_settings.dial_timeout, relay_settings.buffer_size);
    let supervisor = Arc::new(Supervisor::new(relay_settings, metrics.clone()));
    let acceptor = Arc::new(
        TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), mode)
            .await
            .unwrap(),
    );

    let serving = {
        let supervisor = Arc::clone(&supervisor);
        let listener = Arc::clone(&acceptor);
        tokio::spawn(async move {
            supervisor.serve(listener, dialer).await.unwrap();
        })
    };
    (supervisor, acceptor, metrics, serving)
}

#[tokio::test]
async fn test_ping_through_echo_target() {
    let (supervisor, acceptor, metrics, serving) = start(AcceptMode::Cancellable, "echo").await;

    let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(1), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(1), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    drop(client);

    assert!(eventually(Duration::from_secs(2), || supervisor.active_count() == 0).await);
    assert_eq!(metrics.bytes_received(), 4);
    assert_eq!(metrics.bytes_sent(), 4);
    assert_eq!(metrics.outcomes("completed"), 1);

    supervisor.shutdown(acceptor.as_ref()).await;
    assert_ok!(timeout(Duration::from_secs(1), serving).await);
}

#[tokio::test]
async fn test_relay_to_tcp_target_in_deadline_mode() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = upstream.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        request.reverse();
        stream.write_all(&request).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let (supervisor, acceptor, metrics, serving) = start(AcceptMode::Deadline, &target).await;

    let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
    client.write_all(b"abcdef").await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"fedcba");
    server.await.unwrap();

    assert!(eventually(Duration::from_secs(2), || supervisor.active_count() == 0).await);
    assert_eq!(metrics.bytes_received(), 6);
    assert_eq!(metrics.bytes_sent(), 6);

    supervisor.shutdown(acceptor.as_ref()).await;
    assert_ok!(timeout(Duration::from_secs(1), serving).await);
}

#[tokio::test]
async fn test_unreachable_target_closes_client() {
    let unreachable = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let (supervisor, acceptor, metrics, serving) = start(AcceptMode::Cancellable, &unreachable).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await.unwrap();
        // Closed by the relay: either a clean EOF or a reset.
        assert!(read.map(|n| n == 0).unwrap_or(true));
    }

    assert_eq!(metrics.dial_failures(), 2);
    assert_eq!(metrics.relays_started(), 0);
    assert_eq!(supervisor.active_count(), 0);

    supervisor.shutdown(acceptor.as_ref()).await;
    assert_ok!(timeout(Duration::from_secs(1), serving).await);
}
