//! OBS event mapping
//!
//! Translates raw obs-websocket event frames into the typed events the
//! master's translator and the slave's drift detector consume. Events
//! outside the subscribed set are dropped here.

use serde_json::Value;

use crate::protocol::Transform;

/// Events the sync engine reacts to
#[derive(Debug, Clone)]
pub enum ObsEvent {
    ProgramSceneChanged {
        scene_name: String,
    },
    PreviewSceneChanged {
        scene_name: String,
    },
    SceneItemTransformChanged {
        scene_name: String,
        scene_item_id: i64,
        transform: Transform,
    },
    /// Carries only the source name; the scene hosting it is resolved by the
    /// translator.
    FilterSettingsChanged {
        source_name: String,
        filter_name: String,
        filter_settings: Value,
    },
    InputSettingsChanged {
        input_name: String,
        settings: Value,
    },
}

/// Map a raw event frame. Returns `None` for event types the engine does not
/// care about or payloads missing required fields.
pub fn parse_event(event_type: &str, data: &Value) -> Option<ObsEvent> {
    match event_type {
        "CurrentProgramSceneChanged" => Some(ObsEvent::ProgramSceneChanged {
            scene_name: str_field(data, "sceneName")?,
        }),
        "CurrentPreviewSceneChanged" => Some(ObsEvent::PreviewSceneChanged {
            scene_name: str_field(data, "sceneName")?,
        }),
        "SceneItemTransformChanged" => Some(ObsEvent::SceneItemTransformChanged {
            scene_name: str_field(data, "sceneName")?,
            scene_item_id: data.get("sceneItemId")?.as_i64()?,
            transform: serde_json::from_value(data.get("sceneItemTransform")?.clone()).ok()?,
        }),
        "SourceFilterSettingsChanged" => Some(ObsEvent::FilterSettingsChanged {
            source_name: str_field(data, "sourceName")?,
            filter_name: str_field(data, "filterName")?,
            filter_settings: data
                .get("filterSettings")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new())),
        }),
        "InputSettingsChanged" => Some(ObsEvent::InputSettingsChanged {
            input_name: str_field(data, "inputName")?,
            settings: data
                .get("inputSettings")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new())),
        }),
        _ => None,
    }
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)?.as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_scene_changes() {
        let event = parse_event(
            "CurrentProgramSceneChanged",
            &json!({ "sceneName": "Main", "sceneUuid": "x" }),
        );
        assert!(
            matches!(event, Some(ObsEvent::ProgramSceneChanged { scene_name }) if scene_name == "Main")
        );

        let event = parse_event(
            "CurrentPreviewSceneChanged",
            &json!({ "sceneName": "Intermission" }),
        );
        assert!(matches!(event, Some(ObsEvent::PreviewSceneChanged { .. })));
    }

    #[test]
    fn test_parse_transform_changed() {
        let data = json!({
            "sceneName": "Main",
            "sceneItemId": 3,
            "sceneItemTransform": {
                "positionX": 100.0,
                "positionY": 200.0,
                "scaleX": 1.0,
                "scaleY": 1.0,
                "rotation": 0.0,
                "alignment": 5,
                "sourceWidth": 1920.0
            }
        });

        let Some(ObsEvent::SceneItemTransformChanged {
            scene_name,
            scene_item_id,
            transform,
        }) = parse_event("SceneItemTransformChanged", &data)
        else {
            panic!("expected transform event");
        };

        assert_eq!(scene_name, "Main");
        assert_eq!(scene_item_id, 3);
        assert_eq!(transform.position_x, Some(100.0));
        assert_eq!(transform.position_y, Some(200.0));
        assert_eq!(transform.alignment, Some(5));
    }

    #[test]
    fn test_parse_ignores_unknown_and_incomplete() {
        assert!(parse_event("StreamStateChanged", &json!({ "outputActive": true })).is_none());
        assert!(parse_event("CurrentProgramSceneChanged", &json!({})).is_none());
        assert!(parse_event(
            "SceneItemTransformChanged",
            &json!({ "sceneName": "Main" })
        )
        .is_none());
    }
}
