//! Transport tests for the master server
//!
//! These run against real sockets on loopback with OS-assigned ports; no OBS
//! instance is involved.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::*;
use crate::protocol::{
    DesyncDetail, AlertSeverity, DriftCategory, SlaveStatusReportPayload, SyncTargetType,
};

fn new_server() -> MasterServer {
    MasterServer::new(Arc::new(MetricsRecorder::default()))
}

async fn recv_text(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Option<String> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .ok()??;
        match frame.ok()? {
            Message::Text(text) => return Some(text),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_start_stop_start_frees_port() {
    let server = new_server();
    let port = server.start(0).await.unwrap();
    server.stop().await.unwrap();

    // The same port must be immediately bindable again
    let server2 = new_server();
    server2.start(port).await.unwrap();
    server2.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_without_start_is_not_running() {
    let server = new_server();
    assert!(matches!(server.stop().await, Err(SyncError::NotRunning)));
}

#[tokio::test]
async fn test_double_start_rejected() {
    let server = new_server();
    server.start(0).await.unwrap();
    assert!(server.start(0).await.is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_connected_client() {
    let server = new_server();
    let mut snapshot_requests = server.take_snapshot_requests().unwrap();
    let port = server.start(0).await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    wait_for(|| server.connected_count() == 1).await;

    // A fresh connection asks for a snapshot on the master's behalf
    let requested_id = tokio::time::timeout(Duration::from_secs(2), snapshot_requests.recv())
        .await
        .unwrap()
        .unwrap();
    let info = server.clients_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].id, requested_id);

    server.broadcast(SyncMessage::new(
        SyncMessageType::SceneChange,
        SyncTargetType::Program,
        serde_json::json!({ "sceneName": "Intermission" }),
    ));

    let text = recv_text(&mut ws).await.unwrap();
    let message = SyncMessage::decode(&text).unwrap();
    assert_eq!(message.kind, SyncMessageType::SceneChange);
    assert_eq!(message.payload["sceneName"], "Intermission");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_targeted_send_and_unknown_client() {
    let server = new_server();
    let port = server.start(0).await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    wait_for(|| server.connected_count() == 1).await;
    let client_id = server.clients_info()[0].id.clone();

    server
        .send_to(&client_id, SyncMessage::heartbeat())
        .unwrap();
    let text = recv_text(&mut ws).await.unwrap();
    assert_eq!(
        SyncMessage::decode(&text).unwrap().kind,
        SyncMessageType::Heartbeat
    );

    assert!(matches!(
        server.send_to("nope", SyncMessage::heartbeat()),
        Err(SyncError::PeerGone)
    ));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_report_updates_slave_statuses() {
    let server = new_server();
    let port = server.start(0).await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    wait_for(|| server.connected_count() == 1).await;

    let report = SyncMessage::with_payload(
        SyncMessageType::SlaveStatusReport,
        SyncTargetType::Program,
        &SlaveStatusReportPayload {
            is_synced: false,
            desync_details: vec![DesyncDetail {
                category: DriftCategory::TransformMismatch,
                scene_name: "Main".into(),
                source_name: "Cam".into(),
                description: "positionX differs".into(),
                severity: AlertSeverity::Warning,
            }],
        },
    )
    .unwrap();
    ws.send(Message::Text(report.encode().unwrap()))
        .await
        .unwrap();

    wait_for(|| !server.slave_statuses().is_empty()).await;
    let statuses = server.slave_statuses();
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].is_synced);
    assert_eq!(statuses[0].desync_details.len(), 1);
    assert_eq!(statuses[0].desync_details[0].scene_name, "Main");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_disconnect_removes_session() {
    let server = new_server();
    let port = server.start(0).await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    wait_for(|| server.connected_count() == 1).await;

    ws.close(None).await.unwrap();
    wait_for(|| server.connected_count() == 0).await;

    server.stop().await.unwrap();
}
