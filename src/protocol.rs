//! Sync message protocol between master and slave
//!
//! Wire format is JSON over WebSocket text frames. Every message carries the
//! same envelope: kind, millisecond timestamp, target type, and a payload
//! object whose shape depends on the kind. Binary image bytes travel
//! Base64-encoded inside the payload.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Hard cap on a single synced image (decoded size)
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessageType {
    SourceUpdate,
    TransformUpdate,
    SceneChange,
    FilterUpdate,
    ImageUpdate,
    StateSync,
    StateSyncRequest,
    Heartbeat,
    SlaveStatusReport,
}

impl SyncMessageType {
    /// Name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceUpdate => "source_update",
            Self::TransformUpdate => "transform_update",
            Self::SceneChange => "scene_change",
            Self::FilterUpdate => "filter_update",
            Self::ImageUpdate => "image_update",
            Self::StateSync => "state_sync",
            Self::StateSyncRequest => "state_sync_request",
            Self::Heartbeat => "heartbeat",
            Self::SlaveStatusReport => "slave_status_report",
        }
    }
}

/// Operator-selected event class a message belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncTargetType {
    Source,
    Preview,
    Program,
}

/// Message envelope shared by every sync message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: SyncMessageType,
    /// Sender clock, milliseconds since the epoch. Clocks are not
    /// synchronized between master and slave; derived latencies are
    /// indicative only.
    pub timestamp: i64,
    #[serde(rename = "targetType")]
    pub target_type: SyncTargetType,
    pub payload: Value,
}

impl SyncMessage {
    pub fn new(kind: SyncMessageType, target_type: SyncTargetType, payload: Value) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            target_type,
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(
            SyncMessageType::Heartbeat,
            SyncTargetType::Program,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn state_sync_request() -> Self {
        Self::new(
            SyncMessageType::StateSyncRequest,
            SyncTargetType::Program,
            Value::Object(serde_json::Map::new()),
        )
    }

    /// Build a message from a typed payload
    pub fn with_payload<P: Serialize>(
        kind: SyncMessageType,
        target_type: SyncTargetType,
        payload: &P,
    ) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .map_err(|e| SyncError::protocol(format!("failed to serialize payload: {e}")))?;
        Ok(Self::new(kind, target_type, value))
    }

    /// Serialize for the wire
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SyncError::protocol(format!("failed to serialize message: {e}")))
    }

    /// Parse a wire frame
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::malformed(e.to_string()))
    }

    /// Interpret the payload as a typed shape
    pub fn parse_payload<P: for<'de> Deserialize<'de>>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| SyncError::malformed(format!("{} payload: {e}", self.kind.as_str())))
    }
}

/// Geometric parameters of a scene item.
///
/// Fields absent from a partial update are `None` and leave the slave's
/// current value untouched on merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_alignment: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds_height: Option<f64>,
}

impl Transform {
    /// Overlay `update` onto `self`: present fields win, absent fields keep
    /// their current value.
    pub fn merge_from(&mut self, update: &Transform) {
        macro_rules! take {
            ($field:ident) => {
                if update.$field.is_some() {
                    self.$field = update.$field.clone();
                }
            };
        }
        take!(position_x);
        take!(position_y);
        take!(rotation);
        take!(scale_x);
        take!(scale_y);
        take!(width);
        take!(height);
        take!(alignment);
        take!(bounds_type);
        take!(bounds_alignment);
        take!(bounds_width);
        take!(bounds_height);
    }

    pub fn is_empty(&self) -> bool {
        *self == Transform::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformUpdatePayload {
    pub scene_name: String,
    /// Scene-item id on the *sender's* OBS. Not portable; receivers resolve
    /// by (sceneName, sourceName) and fall back to this id only when no
    /// source name was attached.
    pub scene_item_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    pub transform: Transform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneChangePayload {
    pub scene_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterUpdatePayload {
    pub scene_name: String,
    pub scene_item_id: i64,
    pub source_name: String,
    pub filter_name: String,
    pub filter_settings: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdatePayload {
    pub scene_name: String,
    pub source_name: String,
    /// Original file path on the master, informational only
    pub file: String,
    /// Base64-encoded file content
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl ImageUpdatePayload {
    /// Decode the image bytes, validating the Base64 framing and the size cap
    pub fn decode_data(&self, limit: usize) -> Result<Vec<u8>> {
        decode_image_data(&self.data, limit)
    }

    pub fn encode_data(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}

/// Decode a Base64 image field, validating the framing and the size cap
pub fn decode_image_data(data: &str, limit: usize) -> Result<Vec<u8>> {
    // 4 Base64 chars encode at most 3 bytes; refuse to even decode payloads
    // that cannot fit the cap.
    let upper_bound = data.len() / 4 * 3 + 3;
    if upper_bound > limit + 3 {
        return Err(SyncError::ImageTooLarge {
            size: upper_bound,
            limit,
        });
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| SyncError::malformed(format!("image data is not valid Base64: {e}")))?;

    if bytes.len() > limit {
        return Err(SyncError::ImageTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Actions a `source_update` can carry. Only visibility toggles are applied;
/// topology changes stay local by design.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceUpdateAction {
    Created,
    Removed,
    EnabledStateChanged,
    SettingsChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUpdatePayload {
    pub scene_name: String,
    pub scene_item_id: i64,
    pub source_name: String,
    pub action: SourceUpdateAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_item_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// Filter definition with its opaque settings blob
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    pub name: String,
    pub enabled: bool,
    pub settings: Value,
}

/// Image bytes attached to a snapshot item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlob {
    pub source_path: String,
    /// Base64-encoded file content
    pub data: String,
}

/// One placed source inside a snapshot scene. Order matters: snapshot apply
/// iterates items in the order listed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItemSnapshot {
    pub source_name: String,
    pub source_type: String,
    pub transform: Transform,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub name: String,
    #[serde(default)]
    pub items: Vec<SceneItemSnapshot>,
}

/// Full, self-contained description of the master's OBS state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncPayload {
    pub current_program_scene: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_preview_scene: Option<String>,
    #[serde(default)]
    pub scenes: Vec<SceneSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriftCategory {
    SceneMismatch,
    SourceMissing,
    TransformMismatch,
}

/// One observed disagreement between a slave's OBS and its expected state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesyncDetail {
    pub category: DriftCategory,
    pub scene_name: String,
    pub source_name: String,
    pub description: String,
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveStatusReportPayload {
    pub is_synced: bool,
    #[serde(default)]
    pub desync_details: Vec<DesyncDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let msg = SyncMessage::with_payload(
            SyncMessageType::SceneChange,
            SyncTargetType::Program,
            &SceneChangePayload {
                scene_name: "Main".into(),
            },
        )
        .unwrap();

        let text = msg.encode().unwrap();
        let parsed = SyncMessage::decode(&text).unwrap();

        assert_eq!(parsed.kind, SyncMessageType::SceneChange);
        assert_eq!(parsed.target_type, SyncTargetType::Program);
        assert_eq!(parsed.timestamp, msg.timestamp);
        let payload: SceneChangePayload = parsed.parse_payload().unwrap();
        assert_eq!(payload.scene_name, "Main");
    }

    #[test]
    fn test_wire_field_names() {
        let msg = SyncMessage::heartbeat();
        let text = msg.encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(raw["type"], "heartbeat");
        assert_eq!(raw["targetType"], "program");
        assert!(raw["timestamp"].is_i64());
        assert!(raw["payload"].is_object());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let text = r#"{"type":"scene_delete","timestamp":0,"targetType":"program","payload":{}}"#;
        assert!(matches!(
            SyncMessage::decode(text),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SyncMessage::decode("not json").is_err());
        assert!(SyncMessage::decode("{}").is_err());
    }

    #[test]
    fn test_transform_merge() {
        let mut base = Transform {
            position_x: Some(10.0),
            position_y: Some(20.0),
            scale_x: Some(1.0),
            alignment: Some(5),
            ..Default::default()
        };
        let update = Transform {
            position_x: Some(100.0),
            rotation: Some(45.0),
            ..Default::default()
        };

        base.merge_from(&update);

        assert_eq!(base.position_x, Some(100.0));
        assert_eq!(base.position_y, Some(20.0));
        assert_eq!(base.rotation, Some(45.0));
        assert_eq!(base.scale_x, Some(1.0));
        assert_eq!(base.alignment, Some(5));
    }

    #[test]
    fn test_transform_skips_absent_fields_on_wire() {
        let t = Transform {
            position_x: Some(1.5),
            ..Default::default()
        };
        let value = serde_json::to_value(&t).unwrap();
        assert_eq!(value, json!({ "positionX": 1.5 }));
    }

    #[test]
    fn test_image_payload_base64_validation() {
        let payload = ImageUpdatePayload {
            scene_name: "Main".into(),
            source_name: "Logo".into(),
            file: "/tmp/a.png".into(),
            data: "!!!not-base64!!!".into(),
            width: None,
            height: None,
        };
        assert!(matches!(
            payload.decode_data(MAX_IMAGE_BYTES),
            Err(SyncError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_image_payload_size_cap() {
        let bytes = vec![0u8; 64];
        let payload = ImageUpdatePayload {
            scene_name: "Main".into(),
            source_name: "Logo".into(),
            file: "/tmp/a.png".into(),
            data: ImageUpdatePayload::encode_data(&bytes),
            width: None,
            height: None,
        };

        assert_eq!(payload.decode_data(64).unwrap(), bytes);
        assert!(matches!(
            payload.decode_data(32),
            Err(SyncError::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn test_state_sync_payload_round_trip() {
        let payload = StateSyncPayload {
            current_program_scene: "Main".into(),
            current_preview_scene: Some("Intermission".into()),
            scenes: vec![SceneSnapshot {
                name: "Main".into(),
                items: vec![SceneItemSnapshot {
                    source_name: "Cam".into(),
                    source_type: "dshow_input".into(),
                    transform: Transform {
                        position_x: Some(0.0),
                        position_y: Some(0.0),
                        ..Default::default()
                    },
                    filters: vec![FilterSpec {
                        name: "Color".into(),
                        enabled: true,
                        settings: json!({ "gamma": 1.2 }),
                    }],
                    image: None,
                }],
            }],
        };

        let msg = SyncMessage::with_payload(
            SyncMessageType::StateSync,
            SyncTargetType::Program,
            &payload,
        )
        .unwrap();
        let parsed: StateSyncPayload =
            SyncMessage::decode(&msg.encode().unwrap()).unwrap().parse_payload().unwrap();

        assert_eq!(parsed.current_program_scene, "Main");
        assert_eq!(parsed.scenes.len(), 1);
        assert_eq!(parsed.scenes[0].items[0].filters[0].name, "Color");
    }
}
