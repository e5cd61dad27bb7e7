//! Link tests against a real master transport on loopback

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::master::MasterServer;
use crate::protocol::SyncMessageType;

#[test]
fn test_backoff_schedule() {
    assert_eq!(backoff_delay(1), Duration::from_secs(1));
    assert_eq!(backoff_delay(2), Duration::from_secs(2));
    assert_eq!(backoff_delay(3), Duration::from_secs(4));
    assert_eq!(backoff_delay(4), Duration::from_secs(8));
    assert_eq!(backoff_delay(5), Duration::from_secs(16));
    // Ceiling at 30 s from attempt 6 on
    assert_eq!(backoff_delay(6), Duration::from_secs(30));
    assert_eq!(backoff_delay(10), Duration::from_secs(30));
    // Degenerate input clamps to the first slot
    assert_eq!(backoff_delay(0), Duration::from_secs(1));
}

#[test]
fn test_cumulative_schedule_matches_reconnect_storm() {
    // Attempts land at t = 1 s, 3 s, 7 s after the loss
    let mut t = Duration::ZERO;
    let times: Vec<u64> = (1..=3)
        .map(|n| {
            t += backoff_delay(n);
            t.as_secs()
        })
        .collect();
    assert_eq!(times, vec![1, 3, 7]);
}

fn new_link(
    port: u16,
) -> (
    MasterLink,
    mpsc::UnboundedReceiver<SyncMessage>,
    mpsc::UnboundedSender<SyncMessage>,
    mpsc::UnboundedReceiver<bool>,
) {
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let (link, inbound, outbound) = MasterLink::connect(
        "127.0.0.1".to_string(),
        port,
        status_tx,
        Arc::new(MetricsRecorder::default()),
    );
    (link, inbound, outbound, status_rx)
}

async fn expect_status(status_rx: &mut mpsc::UnboundedReceiver<bool>, expected: bool) {
    let got = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
        .await
        .expect("status event in time")
        .expect("status channel open");
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_connect_receive_and_disconnect() {
    let server = MasterServer::new(Arc::new(MetricsRecorder::default()));
    let port = server.start(0).await.unwrap();

    let (link, mut inbound, _outbound, mut status_rx) = new_link(port);
    expect_status(&mut status_rx, true).await;
    assert!(link.is_connected());

    server.broadcast(SyncMessage::heartbeat());
    let message = tokio::time::timeout(Duration::from_secs(3), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.kind, SyncMessageType::Heartbeat);

    link.disconnect();
    expect_status(&mut status_rx, false).await;
    assert!(!link.is_connected());
    assert!(!link.reconnection_status().is_reconnecting);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_post_connect_sync_request_reaches_master() {
    let server = MasterServer::new(Arc::new(MetricsRecorder::default()));
    let mut snapshot_requests = server.take_snapshot_requests().unwrap();
    let port = server.start(0).await.unwrap();

    let (link, _inbound, _outbound, mut status_rx) = new_link(port);
    expect_status(&mut status_rx, true).await;

    // Once for the fresh connection, once for the slave's delayed request
    let first = tokio::time::timeout(Duration::from_secs(3), snapshot_requests.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(3), snapshot_requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, second);

    link.disconnect();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_master_restart() {
    let server = MasterServer::new(Arc::new(MetricsRecorder::default()));
    let port = server.start(0).await.unwrap();

    let (link, mut inbound, _outbound, mut status_rx) = new_link(port);
    expect_status(&mut status_rx, true).await;

    // Master goes away; the link enters reconnecting
    server.stop().await.unwrap();
    expect_status(&mut status_rx, false).await;

    // Master comes back on the same port during the backoff window
    let server2 = MasterServer::new(Arc::new(MetricsRecorder::default()));
    server2.start(port).await.unwrap();

    expect_status(&mut status_rx, true).await;
    assert!(link.is_connected());
    assert_eq!(link.reconnection_status().attempt_count, 0);

    // The re-established session carries traffic
    server2.broadcast(SyncMessage::heartbeat());
    let message = tokio::time::timeout(Duration::from_secs(3), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.kind, SyncMessageType::Heartbeat);

    link.disconnect();
    server2.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_resync_requires_connection() {
    // Nothing is listening on this port
    let (link, _inbound, _outbound, _status_rx) = new_link(1);
    assert!(matches!(
        link.request_resync(),
        Err(SyncError::NotConnected)
    ));
    link.disconnect();
}
