//! Async OBS WebSocket client
//!
//! Dials the local OBS instance, performs the Hello/Identify handshake, and
//! then runs a single reader task that correlates request responses through a
//! pending-request map keyed by request id. OBS may interleave responses with
//! events in any order; correlation by id makes that a non-issue. Events fan
//! out on an mpsc channel that ends when the socket closes — a reconnect
//! takes a fresh subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use super::events::{parse_event, ObsEvent};
use super::protocol::{
    self, check_request_status, identify_frame, op, request_frame, Hello, Identified,
    ServerMessage,
};
use crate::error::{Result, SyncError};

/// Connect attempt budget
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request budget against OBS
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

type EventSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ObsEvent>>>>;

/// Typed RPC handle to one OBS instance.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct ObsClient {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    /// Current event subscriber, if any; events are dropped when nobody
    /// listens
    event_slot: EventSlot,
    next_request_id: AtomicU64,
    connected: Arc<AtomicBool>,
    obs_websocket_version: String,
}

impl ObsClient {
    /// Connect and identify against `ws://{host}:{port}`
    pub async fn connect(host: &str, port: u16, password: Option<&str>) -> Result<Self> {
        let url = format!("ws://{host}:{port}");
        let addr = format!("{host}:{port}");

        let (mut ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| SyncError::Timeout(CONNECT_TIMEOUT.as_secs()))?
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Io(io)
                    if io.kind() == std::io::ErrorKind::ConnectionRefused =>
                {
                    SyncError::ConnectRefused(addr.clone())
                }
                other => SyncError::protocol(format!("websocket connect to {addr}: {other}")),
            })?;

        // Hello (op 0)
        let hello_frame = read_text(&mut ws).await?;
        let hello_msg = ServerMessage::parse(&hello_frame)?;
        if hello_msg.op != op::HELLO {
            return Err(SyncError::protocol(format!(
                "expected Hello, got op {}",
                hello_msg.op
            )));
        }
        let hello: Hello = serde_json::from_value(hello_msg.d)
            .map_err(|e| SyncError::protocol(format!("bad Hello payload: {e}")))?;

        // Identify (op 1), with the auth challenge answered when required
        let authentication = match (&hello.authentication, password) {
            (Some(challenge), Some(password)) => Some(protocol::auth_response(
                password,
                &challenge.challenge,
                &challenge.salt,
            )),
            (Some(_), None) => {
                return Err(SyncError::Auth(
                    "OBS requires a password and none was configured".to_string(),
                ))
            }
            (None, _) => None,
        };
        ws.send(Message::Text(identify_frame(authentication)))
            .await
            .map_err(|e| SyncError::protocol(format!("failed to send Identify: {e}")))?;

        // Identified (op 2), or a close frame when the credentials are wrong
        let identified_frame = match read_frame(&mut ws).await? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.to_string())
                    .unwrap_or_default();
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(0);
                return Err(if code == protocol::CLOSE_AUTH_FAILED {
                    SyncError::Auth(reason)
                } else {
                    SyncError::protocol(format!("OBS closed during identify ({code}): {reason}"))
                });
            }
            other => {
                return Err(SyncError::protocol(format!(
                    "unexpected frame during identify: {other:?}"
                )))
            }
        };
        let identified_msg = ServerMessage::parse(&identified_frame)?;
        if identified_msg.op != op::IDENTIFIED {
            return Err(SyncError::protocol(format!(
                "expected Identified, got op {}",
                identified_msg.op
            )));
        }
        let identified: Identified = serde_json::from_value(identified_msg.d)
            .map_err(|e| SyncError::protocol(format!("bad Identified payload: {e}")))?;
        debug!(
            "OBS identified (obs-websocket {}, rpc v{})",
            hello.obs_websocket_version, identified.negotiated_rpc_version
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let event_slot: EventSlot = Arc::new(Mutex::new(None));

        let (sink, stream) = ws.split();
        spawn_writer(sink, out_rx);
        spawn_reader(
            stream,
            Arc::clone(&pending),
            Arc::clone(&event_slot),
            out_tx.clone(),
            Arc::clone(&connected),
        );

        Ok(Self {
            out_tx,
            pending,
            event_slot,
            next_request_id: AtomicU64::new(1),
            connected,
            obs_websocket_version: hello.obs_websocket_version,
        })
    }

    /// obs-websocket version announced in the Hello frame
    pub fn obs_websocket_version(&self) -> &str {
        &self.obs_websocket_version
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Take a fresh event subscription, replacing any previous one. The
    /// stream is finite: it ends when the connection drops and cannot be
    /// restarted — reconnecting means subscribing again on the new client.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<ObsEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.event_slot.lock() = Some(tx);
        rx
    }

    /// Issue a raw request and return its `responseData`
    pub async fn request(&self, request_type: &str, data: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let request_id = self
            .next_request_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let frame = request_frame(&request_id, request_type, data.as_ref());
        if self.out_tx.send(Message::Text(frame)).is_err() {
            self.pending.lock().remove(&request_id);
            return Err(SyncError::NotConnected);
        }

        let response = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(d)) => d,
            Ok(Err(_)) => return Err(SyncError::PeerGone),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(SyncError::Timeout(REQUEST_TIMEOUT.as_secs()));
            }
        };

        check_request_status(request_type, &response)?;
        Ok(response
            .get("responseData")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new())))
    }

    /// Close the socket. Idempotent.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.out_tx.send(Message::Close(None));
        }
    }
}

impl Drop for ObsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

fn spawn_writer(mut sink: WsSink, mut out_rx: mpsc::UnboundedReceiver<Message>) {
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });
}

fn spawn_reader(
    mut stream: WsStream,
    pending: PendingMap,
    event_slot: EventSlot,
    out_tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let msg = match ServerMessage::parse(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Dropping unreadable OBS frame: {e}");
                            continue;
                        }
                    };
                    match msg.op {
                        op::REQUEST_RESPONSE => {
                            let request_id = msg
                                .d
                                .get("requestId")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            if let Some(tx) = pending.lock().remove(&request_id) {
                                let _ = tx.send(msg.d);
                            } else {
                                trace!("Response for unknown request id {request_id}");
                            }
                        }
                        op::EVENT => {
                            let event_type = msg
                                .d
                                .get("eventType")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            let data = msg.d.get("eventData").cloned().unwrap_or(Value::Null);
                            if let Some(event) = parse_event(event_type, &data) {
                                let mut slot = event_slot.lock();
                                let delivered = match slot.as_ref() {
                                    Some(tx) => tx.send(event).is_ok(),
                                    None => false,
                                };
                                // A gone subscriber is not an error, just
                                // nobody listening anymore
                                if !delivered {
                                    *slot = None;
                                }
                            }
                        }
                        other => trace!("Ignoring obs-websocket op {other}"),
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = out_tx.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        connected.store(false, Ordering::SeqCst);
        // Callers blocked on in-flight requests see the dropped senders
        pending.lock().clear();
        debug!("OBS socket reader finished");
    });
}

async fn read_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<Message> {
    tokio::time::timeout(CONNECT_TIMEOUT, ws.next())
        .await
        .map_err(|_| SyncError::Timeout(CONNECT_TIMEOUT.as_secs()))?
        .ok_or_else(|| SyncError::protocol("OBS closed during handshake".to_string()))?
        .map_err(|e| SyncError::protocol(format!("handshake read failed: {e}")))
}

async fn read_text(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<String> {
    match read_frame(ws).await? {
        Message::Text(text) => Ok(text),
        other => Err(SyncError::protocol(format!(
            "expected a text frame during handshake, got {other:?}"
        ))),
    }
}
