//! Tests for session shutdown and draining

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use common::{settings, ChannelListener, StallingEndpoint};
use tunnel_relay::endpoint::{memory_pair, Endpoint};
use tunnel_relay::metrics::RelayMetrics;
use tunnel_relay::transport::AcceptMode;
use tunnel_relay::{SessionState, Supervisor};

#[tokio::test]
async fn test_drain_deadline_forces_stalled_relay_closed() {
    let drain_timeout = Duration::from_millis(300);
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let supervisor = Supervisor::new(settings(drain_timeout, Duration::from_secs(1)), metrics.clone());
    let (listener, _incoming) = ChannelListener::new(AcceptMode::Cancellable, true);

    let near = StallingEndpoint::shared("stalled-near");
    let far = StallingEndpoint::shared("stalled-far");
    supervisor.admit(near.clone(), far.clone()).unwrap();
    assert_eq!(supervisor.active_count(), 1);

    let signalled = Instant::now();
    let summary = timeout(drain_timeout * 4, supervisor.shutdown(listener.as_ref()))
        .await
        .unwrap();
    let elapsed = signalled.elapsed();

    assert_eq!(summary.forced, 1);
    // Force-closing starts early enough to finish by the deadline.
    assert!(elapsed >= drain_timeout / 2, "drain took {:?}", elapsed);
    assert!(elapsed < drain_timeout + Duration::from_millis(50), "drain took {:?}", elapsed);
    assert_eq!(supervisor.state(), SessionState::Drained);
    assert_eq!(supervisor.active_count(), 0);
    assert!(supervisor.active_relays().is_empty());

    assert!(near.is_closed());
    assert!(far.is_closed());
    assert!(near.close_calls() >= 2);
    assert_eq!(metrics.relays_active(), 0);
    assert_eq!(metrics.outcomes("cancelled"), 1);
}

#[tokio::test]
async fn test_drain_completes_early_when_relays_finish() {
    let drain_timeout = Duration::from_secs(5);
    let supervisor = Supervisor::new(
        settings(drain_timeout, Duration::from_secs(1)),
        Arc::new(RelayMetrics::new().unwrap()),
    );
    let (listener, _incoming) = ChannelListener::new(AcceptMode::Cancellable, true);

    let mut clients = Vec::new();
    for i in 0..3 {
        let (near, client) = memory_pair(format!("client-{}", i), 64);
        let (far, server) = memory_pair(format!("server-{}", i), 64);
        supervisor.admit(near, far).unwrap();
        clients.push((client, server));
    }
    assert_eq!(supervisor.active_relays().len(), 3);

    let summary = timeout(Duration::from_secs(1), supervisor.shutdown(listener.as_ref()))
        .await
        .unwrap();
    assert_eq!(summary.forced, 0);
    assert!(summary.elapsed < drain_timeout);
    assert_eq!(supervisor.active_count(), 0);
    assert_eq!(supervisor.state(), SessionState::Drained);

    // Peers of cancelled relays see their connections go away.
    for (mut client, _server) in clients {
        assert!(client.write_all(b"late").await.is_err());
    }
}

#[tokio::test]
async fn test_wait_drained_resolves_after_shutdown() {
    let supervisor = Arc::new(Supervisor::new(
        settings(Duration::from_secs(1), Duration::from_secs(1)),
        Arc::new(RelayMetrics::new().unwrap()),
    ));
    let (listener, _incoming) = ChannelListener::new(AcceptMode::Cancellable, true);

    let waiter = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.wait_drained().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    supervisor.shutdown(listener.as_ref()).await;
    timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
}
