//! Slave-side connection to the master
//!
//! Single-connection dialer with a reconnect supervisor. States run
//! Disconnected → Connecting → Connected → (Reconnecting | Disconnected);
//! while the operator wants connectivity, a lost session is redialed with
//! exponential backoff, capped in both delay and attempt count. An explicit
//! disconnect cancels the reader, the sender, and any pending backoff sleep
//! together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::metrics::MetricsRecorder;
use crate::protocol::{SyncMessage, SyncMessageType};

/// Reconnect attempt budget before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Backoff ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Dial budget per attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between session establishment and the snapshot request, letting
/// master-side bookkeeping settle
const SYNC_REQUEST_DELAY: Duration = Duration::from_millis(500);

/// Backoff before reconnect attempt `n` (1-based): 1 s, 2 s, 4 s, ... 30 s
pub fn backoff_delay(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let exp = (attempt - 1).min(63);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionStatus {
    pub is_reconnecting: bool,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ReconnectionStatus {
    fn default() -> Self {
        Self {
            is_reconnecting: false,
            attempt_count: 0,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            last_error: None,
        }
    }
}

/// Handle to the upstream connection. Owns the reconnection state.
pub struct MasterLink {
    host: String,
    port: u16,
    want: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    reconnection: Arc<parking_lot::RwLock<ReconnectionStatus>>,
    outbound_tx: mpsc::UnboundedSender<SyncMessage>,
}

impl MasterLink {
    /// Dial the master and keep the session alive. Returns the link handle,
    /// the inbound message stream (applied in arrival order), and the
    /// outbound sender used for status reports and resync requests.
    /// `status_tx` receives every Connected/Disconnected transition.
    pub fn connect(
        host: String,
        port: u16,
        status_tx: mpsc::UnboundedSender<bool>,
        metrics: Arc<MetricsRecorder>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SyncMessage>,
        mpsc::UnboundedSender<SyncMessage>,
    ) {
        let (want_tx, want_rx) = watch::channel(true);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let reconnection = Arc::new(parking_lot::RwLock::new(ReconnectionStatus::default()));

        tokio::spawn(run_supervisor(SupervisorContext {
            url: format!("ws://{host}:{port}"),
            want_rx,
            inbound_tx,
            outbound_rx,
            outbound_tx: outbound_tx.clone(),
            status_tx,
            connected: Arc::clone(&connected),
            reconnection: Arc::clone(&reconnection),
            metrics,
        }));

        (
            Self {
                host,
                port,
                want: want_tx,
                connected,
                reconnection,
                outbound_tx: outbound_tx.clone(),
            },
            inbound_rx,
            outbound_tx,
        )
    }

    pub fn remote(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnection_status(&self) -> ReconnectionStatus {
        self.reconnection.read().clone()
    }

    /// Ask the master for a fresh snapshot
    pub fn request_resync(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.outbound_tx
            .send(SyncMessage::state_sync_request())
            .map_err(|_| SyncError::PeerGone)?;
        info!("Requested resync from master");
        Ok(())
    }

    /// Stop wanting connectivity: cancels the session and any pending
    /// reconnect
    pub fn disconnect(&self) {
        let _ = self.want.send(false);
        *self.reconnection.write() = ReconnectionStatus::default();
    }
}

struct SupervisorContext {
    url: String,
    want_rx: watch::Receiver<bool>,
    inbound_tx: mpsc::UnboundedSender<SyncMessage>,
    outbound_rx: mpsc::UnboundedReceiver<SyncMessage>,
    outbound_tx: mpsc::UnboundedSender<SyncMessage>,
    status_tx: mpsc::UnboundedSender<bool>,
    connected: Arc<AtomicBool>,
    reconnection: Arc<parking_lot::RwLock<ReconnectionStatus>>,
    metrics: Arc<MetricsRecorder>,
}

async fn run_supervisor(mut ctx: SupervisorContext) {
    let mut attempt: u32 = 0;

    loop {
        if !*ctx.want_rx.borrow() {
            break;
        }

        if attempt > 0 {
            if attempt > MAX_RECONNECT_ATTEMPTS {
                let mut status = ctx.reconnection.write();
                status.is_reconnecting = false;
                status.attempt_count = MAX_RECONNECT_ATTEMPTS;
                status.last_error = Some(format!(
                    "max reconnection attempts ({MAX_RECONNECT_ATTEMPTS}) reached"
                ));
                warn!("Giving up on the master after {MAX_RECONNECT_ATTEMPTS} attempts");
                break;
            }

            let delay = backoff_delay(attempt);
            {
                let mut status = ctx.reconnection.write();
                status.is_reconnecting = true;
                status.attempt_count = attempt;
            }
            info!(
                "Reconnecting to master in {} s (attempt {attempt}/{MAX_RECONNECT_ATTEMPTS})",
                delay.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.want_rx.changed() => {
                    if !*ctx.want_rx.borrow() {
                        break;
                    }
                }
            }
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&ctx.url)).await {
            Ok(Ok((ws, _))) => {
                info!("Connected to master at {}", ctx.url);
                attempt = 0;
                *ctx.reconnection.write() = ReconnectionStatus::default();
                ctx.connected.store(true, Ordering::SeqCst);
                let _ = ctx.status_tx.send(true);

                spawn_sync_request(ctx.outbound_tx.clone(), Arc::clone(&ctx.connected));
                run_session(
                    ws,
                    &mut ctx.outbound_rx,
                    &ctx.inbound_tx,
                    &mut ctx.want_rx,
                    &ctx.metrics,
                )
                .await;

                ctx.connected.store(false, Ordering::SeqCst);
                let _ = ctx.status_tx.send(false);

                if !*ctx.want_rx.borrow() {
                    break;
                }
                warn!("Connection to master lost");
                ctx.reconnection.write().last_error = Some("connection lost".to_string());
                attempt = 1;
            }
            Ok(Err(e)) => {
                attempt += 1;
                debug!("Dial failed: {e}");
                let mut status = ctx.reconnection.write();
                status.is_reconnecting = true;
                status.attempt_count = attempt.min(MAX_RECONNECT_ATTEMPTS);
                status.last_error = Some(e.to_string());
            }
            Err(_) => {
                attempt += 1;
                let mut status = ctx.reconnection.write();
                status.is_reconnecting = true;
                status.attempt_count = attempt.min(MAX_RECONNECT_ATTEMPTS);
                status.last_error =
                    Some(format!("connect timed out after {} s", CONNECT_TIMEOUT.as_secs()));
            }
        }
    }

    ctx.connected.store(false, Ordering::SeqCst);
    debug!("Link supervisor finished");
}

/// Send the post-connect snapshot request after the settle delay
fn spawn_sync_request(outbound_tx: mpsc::UnboundedSender<SyncMessage>, connected: Arc<AtomicBool>) {
    tokio::spawn(async move {
        tokio::time::sleep(SYNC_REQUEST_DELAY).await;
        if connected.load(Ordering::SeqCst) {
            let _ = outbound_tx.send(SyncMessage::state_sync_request());
            debug!("Sent post-connect state sync request");
        }
    });
}

/// Pump one live session until the socket dies or the operator disconnects
async fn run_session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound_rx: &mut mpsc::UnboundedReceiver<SyncMessage>,
    inbound_tx: &mpsc::UnboundedSender<SyncMessage>,
    want_rx: &mut watch::Receiver<bool>,
    metrics: &MetricsRecorder,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = want_rx.changed() => {
                if !*want_rx.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else { break };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode outbound message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match SyncMessage::decode(&text) {
                            Ok(message) => {
                                metrics.record_message(&message, text.len());
                                // Echo heartbeats so the master sees activity
                                // even before any drift reports flow
                                if message.kind == SyncMessageType::Heartbeat {
                                    if let Ok(beat) = SyncMessage::heartbeat().encode() {
                                        if sink.send(Message::Text(beat)).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                if inbound_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Unreadable frame from master: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Socket error from master: {e}");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
