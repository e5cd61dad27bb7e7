//! Per-slave session state on the master
//!
//! Each accepted connection gets a bounded outbound queue drained by its own
//! sender task, so a slow client never blocks the others. Consecutive
//! transform updates for the same scene item are coalesced in place: the
//! newest payload wins but the queue slot (and thus ordering relative to
//! other kinds) is kept. Scene, filter, image, and snapshot messages are
//! never coalesced or dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use crate::protocol::{SyncMessage, SyncMessageType, TransformUpdatePayload};

/// Outbound queue capacity per session
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// Consecutive refused enqueues before a session counts as persistently
/// behind and is closed
pub const OVERFLOW_STRIKES: u32 = 3;

/// Master-side view of one connected slave
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub remote_address: String,
    pub connected_at: i64,
    pub last_activity: i64,
}

/// Latest drift report received from a slave
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatus {
    pub client_id: String,
    pub is_synced: bool,
    pub desync_details: Vec<crate::protocol::DesyncDetail>,
    pub last_report_time: i64,
}

/// What happened to a pushed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Replaced an older transform for the same scene item, slot kept
    Coalesced,
    /// Queue was full; the oldest droppable message made room
    DroppedOldest,
    /// Queue full and nothing droppable; caller should count a strike
    Refused,
}

type CoalesceKey = (String, i64);

struct QueuedEntry {
    message: SyncMessage,
    coalesce_key: Option<CoalesceKey>,
}

/// Bounded FIFO with in-place transform coalescing
pub struct SessionQueue {
    entries: VecDeque<QueuedEntry>,
    capacity: usize,
}

impl SessionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, message: SyncMessage) -> PushOutcome {
        let coalesce_key = coalesce_key_of(&message);

        if let Some(key) = &coalesce_key {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.coalesce_key.as_ref() == Some(key))
            {
                entry.message = message;
                return PushOutcome::Coalesced;
            }
        }

        if self.entries.len() < self.capacity {
            self.entries.push_back(QueuedEntry {
                message,
                coalesce_key,
            });
            return PushOutcome::Enqueued;
        }

        // Full: sacrifice the oldest droppable entry
        if let Some(idx) = self.entries.iter().position(|e| is_droppable(&e.message)) {
            self.entries.remove(idx);
            self.entries.push_back(QueuedEntry {
                message,
                coalesce_key,
            });
            return PushOutcome::DroppedOldest;
        }

        PushOutcome::Refused
    }

    pub fn pop(&mut self) -> Option<SyncMessage> {
        self.entries.pop_front().map(|e| e.message)
    }
}

/// Transform updates coalesce per (scene, item id)
fn coalesce_key_of(message: &SyncMessage) -> Option<CoalesceKey> {
    if message.kind != SyncMessageType::TransformUpdate {
        return None;
    }
    let payload: TransformUpdatePayload = message.parse_payload().ok()?;
    Some((payload.scene_name, payload.scene_item_id))
}

/// Scene, filter, image, and snapshot messages must survive overflow
fn is_droppable(message: &SyncMessage) -> bool {
    matches!(
        message.kind,
        SyncMessageType::TransformUpdate
            | SyncMessageType::SourceUpdate
            | SyncMessageType::Heartbeat
    )
}

/// One accepted slave connection. Owned by the master transport; reader and
/// sender tasks share it behind an `Arc`.
pub struct ClientSession {
    pub id: String,
    pub remote_address: String,
    pub connected_at: i64,
    last_activity: AtomicI64,
    queue: Mutex<SessionQueue>,
    /// Wakes the sender task when the queue gains entries
    notify: Notify,
    overflow_strikes: AtomicU32,
    close_tx: watch::Sender<bool>,
}

impl ClientSession {
    pub fn new(id: String, remote_address: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            remote_address,
            connected_at: now,
            last_activity: AtomicI64::new(now),
            queue: Mutex::new(SessionQueue::new(SESSION_QUEUE_CAPACITY)),
            notify: Notify::new(),
            overflow_strikes: AtomicU32::new(0),
            close_tx,
        }
    }

    /// Enqueue for delivery. Returns `false` when the session is persistently
    /// behind and should be closed.
    pub fn enqueue(&self, message: SyncMessage) -> bool {
        let outcome = self.queue.lock().push(message);
        match outcome {
            PushOutcome::Refused => {
                let strikes = self.overflow_strikes.fetch_add(1, Ordering::SeqCst) + 1;
                strikes <= OVERFLOW_STRIKES
            }
            _ => {
                self.overflow_strikes.store(0, Ordering::SeqCst);
                self.notify.notify_one();
                true
            }
        }
    }

    pub fn pop(&self) -> Option<SyncMessage> {
        self.queue.lock().pop()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Await more work for the sender task
    pub async fn wait_for_messages(&self) {
        self.notify.notified().await;
    }

    /// Record inbound traffic from the peer
    pub fn touch_activity(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Milliseconds since the peer last sent any frame
    pub fn idle_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.last_activity()
    }

    pub fn request_close(&self) {
        let _ = self.close_tx.send(true);
        self.notify.notify_one();
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        *self.close_tx.borrow()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            remote_address: self.remote_address.clone(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SyncTargetType, Transform};
    use serde_json::json;

    fn transform_msg(scene: &str, item_id: i64, x: f64) -> SyncMessage {
        SyncMessage::with_payload(
            SyncMessageType::TransformUpdate,
            SyncTargetType::Source,
            &TransformUpdatePayload {
                scene_name: scene.to_string(),
                scene_item_id: item_id,
                source_name: Some("Cam".to_string()),
                transform: Transform {
                    position_x: Some(x),
                    ..Default::default()
                },
            },
        )
        .unwrap()
    }

    fn scene_msg(name: &str) -> SyncMessage {
        SyncMessage::new(
            SyncMessageType::SceneChange,
            SyncTargetType::Program,
            json!({ "sceneName": name }),
        )
    }

    #[test]
    fn test_fifo_order_across_kinds() {
        let mut queue = SessionQueue::new(8);
        queue.push(scene_msg("A"));
        queue.push(transform_msg("Main", 1, 10.0));
        queue.push(scene_msg("B"));

        assert_eq!(queue.pop().unwrap().kind, SyncMessageType::SceneChange);
        assert_eq!(queue.pop().unwrap().kind, SyncMessageType::TransformUpdate);
        assert_eq!(queue.pop().unwrap().kind, SyncMessageType::SceneChange);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_transform_coalesces_in_place() {
        let mut queue = SessionQueue::new(8);
        queue.push(transform_msg("Main", 3, 0.0));
        queue.push(scene_msg("B"));
        assert_eq!(
            queue.push(transform_msg("Main", 3, 100.0)),
            PushOutcome::Coalesced
        );
        assert_eq!(queue.len(), 2);

        // Slot kept: the transform still precedes the scene change
        let first = queue.pop().unwrap();
        assert_eq!(first.kind, SyncMessageType::TransformUpdate);
        let payload: TransformUpdatePayload = first.parse_payload().unwrap();
        assert_eq!(payload.transform.position_x, Some(100.0));
    }

    #[test]
    fn test_distinct_items_do_not_coalesce() {
        let mut queue = SessionQueue::new(8);
        queue.push(transform_msg("Main", 1, 1.0));
        assert_eq!(queue.push(transform_msg("Main", 2, 2.0)), PushOutcome::Enqueued);
        assert_eq!(
            queue.push(transform_msg("Other", 1, 3.0)),
            PushOutcome::Enqueued
        );
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_overflow_drops_oldest_droppable() {
        let mut queue = SessionQueue::new(2);
        queue.push(transform_msg("Main", 1, 1.0));
        queue.push(scene_msg("A"));

        // Full; a new scene change evicts the old transform, not the scene
        assert_eq!(queue.push(scene_msg("B")), PushOutcome::DroppedOldest);
        assert_eq!(queue.pop().unwrap().kind, SyncMessageType::SceneChange);
        assert_eq!(queue.pop().unwrap().kind, SyncMessageType::SceneChange);
    }

    #[test]
    fn test_overflow_refuses_when_nothing_droppable() {
        let mut queue = SessionQueue::new(2);
        queue.push(scene_msg("A"));
        queue.push(scene_msg("B"));
        assert_eq!(queue.push(scene_msg("C")), PushOutcome::Refused);
        // Nothing was lost
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_session_strikes_close_persistently_behind() {
        let session = ClientSession::new("c1".into(), "10.0.0.2:50000".into());
        for _ in 0..SESSION_QUEUE_CAPACITY {
            assert!(session.enqueue(scene_msg("X")));
        }
        // Queue is saturated with undroppable messages
        for _ in 0..OVERFLOW_STRIKES {
            assert!(session.enqueue(scene_msg("Y")));
        }
        assert!(!session.enqueue(scene_msg("Z")));
    }
}
