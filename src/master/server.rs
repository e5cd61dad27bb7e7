//! Master transport
//!
//! Accepts slave connections on a listening socket and fans sync messages
//! out through per-session bounded queues. One reader and one sender task per
//! session; a slow client only ever stalls itself. Liveness is tracked from
//! inbound frames and enforced by the heartbeat sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{ClientInfo, ClientSession, SlaveStatus};
use crate::error::{Result, SyncError};
use crate::metrics::MetricsRecorder;
use crate::protocol::{SlaveStatusReportPayload, SyncMessage, SyncMessageType};

/// Master announces itself this often
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A single outbound frame that cannot be written within this budget marks
/// the session dead
const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Peer silence budget before the session is closed
const ACTIVITY_IDLE_MILLIS: i64 = 30_000;

/// Outbound queues get this long to drain on `stop`
const STOP_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

type SessionMap = Arc<RwLock<HashMap<String, Arc<ClientSession>>>>;
type StatusMap = Arc<RwLock<HashMap<String, SlaveStatus>>>;

struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

pub struct MasterServer {
    sessions: SessionMap,
    slave_statuses: StatusMap,
    /// Client ids that need a full snapshot (fresh connections and explicit
    /// `state_sync_request`s); drained by the snapshot pump
    snapshot_tx: mpsc::UnboundedSender<String>,
    snapshot_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    metrics: Arc<MetricsRecorder>,
    running: Mutex<Option<RunningState>>,
}

impl MasterServer {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            slave_statuses: Arc::new(RwLock::new(HashMap::new())),
            snapshot_tx,
            snapshot_rx: Mutex::new(Some(snapshot_rx)),
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Take the stream of client ids awaiting a snapshot
    pub fn take_snapshot_requests(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.snapshot_rx.lock().take()
    }

    /// Bind and start accepting slaves. Returns the bound port (useful when
    /// asking for an OS-assigned one).
    pub async fn start(&self, port: u16) -> Result<u16> {
        if self.running.lock().is_some() {
            return Err(SyncError::Unsupported(
                "master server is already running".to_string(),
            ));
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| SyncError::from_bind_error(e, port))?;
        let bound_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(port);
        info!("Master server listening on 0.0.0.0:{bound_port}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let acceptor = spawn_acceptor(
            listener,
            Arc::clone(&self.sessions),
            Arc::clone(&self.slave_statuses),
            self.snapshot_tx.clone(),
            Arc::clone(&self.metrics),
            shutdown_rx.clone(),
        );
        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.sessions),
            Arc::clone(&self.slave_statuses),
            shutdown_rx,
        );

        *self.running.lock() = Some(RunningState {
            shutdown_tx,
            acceptor,
            heartbeat,
        });
        Ok(bound_port)
    }

    /// Close the listener, drain outbound queues best-effort, then force
    /// everything down
    pub async fn stop(&self) -> Result<()> {
        let state = self.running.lock().take().ok_or(SyncError::NotRunning)?;
        let _ = state.shutdown_tx.send(true);

        // Ask every session to finish its queue and close
        for session in self.session_snapshot() {
            session.request_close();
        }

        let sessions = Arc::clone(&self.sessions);
        let drained = tokio::time::timeout(STOP_DRAIN_DEADLINE, async move {
            loop {
                let pending: usize = sessions.read().values().map(|s| s.queue_len()).sum();
                if pending == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Stopping master with undelivered messages still queued");
        }

        if tokio::time::timeout(Duration::from_millis(500), state.acceptor)
            .await
            .is_err()
        {
            warn!("Acceptor did not stop in time");
        }
        state.heartbeat.abort();

        self.sessions.write().clear();
        self.slave_statuses.write().clear();
        info!("Master server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Enqueue a message to every connected session
    pub fn broadcast(&self, message: SyncMessage) {
        let byte_count = message.encode().map(|t| t.len()).unwrap_or(0);
        for session in self.session_snapshot() {
            if !session.enqueue(message.clone()) {
                warn!(
                    "Session {} is persistently behind, closing",
                    session.id
                );
                self.close_session(&session.id);
            }
        }
        self.metrics.record(message.kind.as_str(), 0.0, byte_count);
    }

    /// Enqueue a message to one session
    pub fn send_to(&self, client_id: &str, message: SyncMessage) -> Result<()> {
        let session = self
            .sessions
            .read()
            .get(client_id)
            .cloned()
            .ok_or(SyncError::PeerGone)?;
        let kind = message.kind;
        let byte_count = message.encode().map(|t| t.len()).unwrap_or(0);
        if !session.enqueue(message) {
            self.close_session(client_id);
            return Err(SyncError::PeerGone);
        }
        self.metrics.record(kind.as_str(), 0.0, byte_count);
        Ok(())
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn clients_info(&self) -> Vec<ClientInfo> {
        self.sessions.read().values().map(|s| s.info()).collect()
    }

    pub fn slave_statuses(&self) -> Vec<SlaveStatus> {
        self.slave_statuses.read().values().cloned().collect()
    }

    fn session_snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().values().cloned().collect()
    }

    fn close_session(&self, client_id: &str) {
        if let Some(session) = self.sessions.write().remove(client_id) {
            session.request_close();
        }
        self.slave_statuses.write().remove(client_id);
    }
}

fn spawn_acceptor(
    listener: TcpListener,
    sessions: SessionMap,
    statuses: StatusMap,
    snapshot_tx: mpsc::UnboundedSender<String>,
    metrics: Arc<MetricsRecorder>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            addr.to_string(),
                            Arc::clone(&sessions),
                            Arc::clone(&statuses),
                            snapshot_tx.clone(),
                            Arc::clone(&metrics),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
        // Listener drops here, freeing the port
        debug!("Acceptor stopped");
    })
}

fn spawn_heartbeat(
    sessions: SessionMap,
    statuses: StatusMap,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            let snapshot: Vec<Arc<ClientSession>> = sessions.read().values().cloned().collect();
            for session in snapshot {
                if session.idle_millis() > ACTIVITY_IDLE_MILLIS {
                    warn!(
                        "Session {} silent for {} ms, closing",
                        session.id,
                        session.idle_millis()
                    );
                    sessions.write().remove(&session.id);
                    statuses.write().remove(&session.id);
                    session.request_close();
                    continue;
                }
                if !session.enqueue(SyncMessage::heartbeat()) {
                    sessions.write().remove(&session.id);
                    statuses.write().remove(&session.id);
                    session.request_close();
                }
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    remote_address: String,
    sessions: SessionMap,
    statuses: StatusMap,
    snapshot_tx: mpsc::UnboundedSender<String>,
    metrics: Arc<MetricsRecorder>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {remote_address} failed: {e}");
            return;
        }
    };

    let client_id = Uuid::new_v4().to_string()[..8].to_string();
    let session = Arc::new(ClientSession::new(client_id.clone(), remote_address.clone()));
    sessions
        .write()
        .insert(client_id.clone(), Arc::clone(&session));
    info!("Slave {client_id} connected from {remote_address}");

    // New slaves get a snapshot without waiting for their explicit request
    let _ = snapshot_tx.send(client_id.clone());

    let (ws_sender, ws_receiver) = ws.split();
    let sender_task = tokio::spawn(run_session_sender(Arc::clone(&session), ws_sender));

    run_session_reader(
        Arc::clone(&session),
        ws_receiver,
        Arc::clone(&statuses),
        snapshot_tx,
        metrics,
    )
    .await;

    // Reader finished: tear the session down
    sessions.write().remove(&client_id);
    statuses.write().remove(&client_id);
    session.request_close();
    let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;
    info!("Slave {client_id} disconnected");
}

async fn run_session_sender(
    session: Arc<ClientSession>,
    mut ws_sender: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
) {
    let mut close_rx = session.close_signal();
    'outer: loop {
        while let Some(message) = session.pop() {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode outbound message: {e}");
                    continue;
                }
            };
            match tokio::time::timeout(SEND_STALL_TIMEOUT, ws_sender.send(Message::Text(text)))
                .await
            {
                Ok(Ok(())) => {}
                _ => {
                    warn!("Send to {} stalled, closing session", session.id);
                    session.request_close();
                    break 'outer;
                }
            }
        }

        if session.is_closing() {
            break;
        }
        tokio::select! {
            _ = session.wait_for_messages() => {}
            _ = close_rx.changed() => {}
        }
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

async fn run_session_reader(
    session: Arc<ClientSession>,
    mut ws_receiver: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<TcpStream>,
    >,
    statuses: StatusMap,
    snapshot_tx: mpsc::UnboundedSender<String>,
    metrics: Arc<MetricsRecorder>,
) {
    let mut close_rx = session.close_signal();
    loop {
        let frame = tokio::select! {
            _ = close_rx.changed() => break,
            frame = ws_receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                session.touch_activity();
                let message = match SyncMessage::decode(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Unreadable frame from {}: {e}", session.id);
                        continue;
                    }
                };
                metrics.record_message(&message, text.len());
                handle_inbound(&session, message, &statuses, &snapshot_tx);
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => session.touch_activity(),
            Some(Err(e)) => {
                warn!("Socket error from {}: {e}", session.id);
                break;
            }
        }
    }
}

fn handle_inbound(
    session: &ClientSession,
    message: SyncMessage,
    statuses: &StatusMap,
    snapshot_tx: &mpsc::UnboundedSender<String>,
) {
    match message.kind {
        SyncMessageType::StateSyncRequest => {
            debug!("Snapshot requested by {}", session.id);
            let _ = snapshot_tx.send(session.id.clone());
        }
        SyncMessageType::SlaveStatusReport => {
            match message.parse_payload::<SlaveStatusReportPayload>() {
                Ok(report) => {
                    statuses.write().insert(
                        session.id.clone(),
                        SlaveStatus {
                            client_id: session.id.clone(),
                            is_synced: report.is_synced,
                            desync_details: report.desync_details,
                            last_report_time: chrono::Utc::now().timestamp_millis(),
                        },
                    );
                }
                Err(e) => warn!("Bad status report from {}: {e}", session.id),
            }
        }
        SyncMessageType::Heartbeat => {}
        other => debug!("Ignoring {} from {}", other.as_str(), session.id),
    }
}

#[cfg(test)]
mod tests;
