//! Typed OBS operations
//!
//! Thin wrappers mapping the operations the sync engine needs onto single
//! obs-websocket requests. Settings blobs stay `serde_json::Value` — OBS
//! input and filter settings are opaque and vary per source kind.

use serde_json::{json, Value};

use super::client::ObsClient;
use crate::error::{Result, SyncError};
use crate::protocol::{FilterSpec, Transform};

/// One entry of `GetSceneItemList`
#[derive(Debug, Clone)]
pub struct SceneItemInfo {
    pub scene_item_id: i64,
    pub source_name: String,
    /// Input kind, e.g. `image_source`; `None` for nested scenes/groups
    pub input_kind: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ObsVersion {
    pub obs_version: String,
    pub obs_websocket_version: String,
}

impl ObsClient {
    pub async fn version(&self) -> Result<ObsVersion> {
        let data = self.request("GetVersion", None).await?;
        Ok(ObsVersion {
            obs_version: str_of(&data, "obsVersion")?,
            obs_websocket_version: str_of(&data, "obsWebSocketVersion")?,
        })
    }

    pub async fn studio_mode_enabled(&self) -> Result<bool> {
        let data = self.request("GetStudioModeEnabled", None).await?;
        Ok(data
            .get("studioModeEnabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Scene names in display order (OBS reports them bottom-up; callers
    /// iterate as returned)
    pub async fn list_scenes(&self) -> Result<Vec<String>> {
        let data = self.request("GetSceneList", None).await?;
        let scenes = data
            .get("scenes")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SyncError::protocol("GetSceneList: missing scenes array"))?;
        Ok(scenes
            .iter()
            .filter_map(|s| s.get("sceneName").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .collect())
    }

    pub async fn current_program_scene(&self) -> Result<String> {
        let data = self.request("GetCurrentProgramScene", None).await?;
        str_of(&data, "currentProgramSceneName")
    }

    pub async fn set_current_program_scene(&self, scene_name: &str) -> Result<()> {
        self.request(
            "SetCurrentProgramScene",
            Some(json!({ "sceneName": scene_name })),
        )
        .await?;
        Ok(())
    }

    /// Fails with `Unsupported` when Studio Mode is disabled
    pub async fn current_preview_scene(&self) -> Result<String> {
        let data = self
            .request("GetCurrentPreviewScene", None)
            .await
            .map_err(studio_mode_unsupported)?;
        str_of(&data, "currentPreviewSceneName")
    }

    pub async fn set_current_preview_scene(&self, scene_name: &str) -> Result<()> {
        self.request(
            "SetCurrentPreviewScene",
            Some(json!({ "sceneName": scene_name })),
        )
        .await
        .map_err(studio_mode_unsupported)?;
        Ok(())
    }

    pub async fn list_scene_items(&self, scene_name: &str) -> Result<Vec<SceneItemInfo>> {
        let data = self
            .request("GetSceneItemList", Some(json!({ "sceneName": scene_name })))
            .await?;
        let items = data
            .get("sceneItems")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SyncError::protocol("GetSceneItemList: missing sceneItems array"))?;

        Ok(items
            .iter()
            .filter_map(|item| {
                Some(SceneItemInfo {
                    scene_item_id: item.get("sceneItemId")?.as_i64()?,
                    source_name: item.get("sourceName")?.as_str()?.to_string(),
                    input_kind: item
                        .get("inputKind")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    enabled: item
                        .get("sceneItemEnabled")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true),
                })
            })
            .collect())
    }

    /// Resolve the local scene-item id of a named source within a scene
    pub async fn scene_item_id(&self, scene_name: &str, source_name: &str) -> Result<i64> {
        let data = self
            .request(
                "GetSceneItemId",
                Some(json!({ "sceneName": scene_name, "sourceName": source_name })),
            )
            .await?;
        data.get("sceneItemId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SyncError::protocol("GetSceneItemId: missing sceneItemId"))
    }

    pub async fn scene_item_transform(&self, scene_name: &str, item_id: i64) -> Result<Transform> {
        let data = self
            .request(
                "GetSceneItemTransform",
                Some(json!({ "sceneName": scene_name, "sceneItemId": item_id })),
            )
            .await?;
        let transform = data
            .get("sceneItemTransform")
            .cloned()
            .ok_or_else(|| SyncError::protocol("GetSceneItemTransform: missing transform"))?;
        serde_json::from_value(transform)
            .map_err(|e| SyncError::protocol(format!("bad sceneItemTransform: {e}")))
    }

    /// Apply the `Some` fields of `transform`; absent fields are untouched
    pub async fn set_scene_item_transform(
        &self,
        scene_name: &str,
        item_id: i64,
        transform: &Transform,
    ) -> Result<()> {
        let transform_value = serde_json::to_value(transform)
            .map_err(|e| SyncError::protocol(format!("bad transform: {e}")))?;
        self.request(
            "SetSceneItemTransform",
            Some(json!({
                "sceneName": scene_name,
                "sceneItemId": item_id,
                "sceneItemTransform": transform_value,
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn set_scene_item_enabled(
        &self,
        scene_name: &str,
        item_id: i64,
        enabled: bool,
    ) -> Result<()> {
        self.request(
            "SetSceneItemEnabled",
            Some(json!({
                "sceneName": scene_name,
                "sceneItemId": item_id,
                "sceneItemEnabled": enabled,
            })),
        )
        .await?;
        Ok(())
    }

    /// Returns (input kind, settings blob)
    pub async fn input_settings(&self, input_name: &str) -> Result<(String, Value)> {
        let data = self
            .request("GetInputSettings", Some(json!({ "inputName": input_name })))
            .await?;
        let kind = str_of(&data, "inputKind")?;
        let settings = data
            .get("inputSettings")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        Ok((kind, settings))
    }

    pub async fn set_input_settings(
        &self,
        input_name: &str,
        settings: &Value,
        overlay: bool,
    ) -> Result<()> {
        self.request(
            "SetInputSettings",
            Some(json!({
                "inputName": input_name,
                "inputSettings": settings,
                "overlay": overlay,
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn list_filters(&self, source_name: &str) -> Result<Vec<FilterSpec>> {
        let data = self
            .request(
                "GetSourceFilterList",
                Some(json!({ "sourceName": source_name })),
            )
            .await?;
        let filters = data
            .get("filters")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SyncError::protocol("GetSourceFilterList: missing filters array"))?;

        Ok(filters
            .iter()
            .filter_map(|f| {
                Some(FilterSpec {
                    name: f.get("filterName")?.as_str()?.to_string(),
                    enabled: f
                        .get("filterEnabled")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true),
                    settings: f
                        .get("filterSettings")
                        .cloned()
                        .unwrap_or(Value::Object(serde_json::Map::new())),
                })
            })
            .collect())
    }

    pub async fn filter_settings(&self, source_name: &str, filter_name: &str) -> Result<FilterSpec> {
        let data = self
            .request(
                "GetSourceFilter",
                Some(json!({ "sourceName": source_name, "filterName": filter_name })),
            )
            .await?;
        Ok(FilterSpec {
            name: filter_name.to_string(),
            enabled: data
                .get("filterEnabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            settings: data
                .get("filterSettings")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new())),
        })
    }

    pub async fn set_filter_settings(
        &self,
        source_name: &str,
        filter_name: &str,
        settings: &Value,
        overlay: bool,
    ) -> Result<()> {
        self.request(
            "SetSourceFilterSettings",
            Some(json!({
                "sourceName": source_name,
                "filterName": filter_name,
                "filterSettings": settings,
                "overlay": overlay,
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn set_filter_enabled(
        &self,
        source_name: &str,
        filter_name: &str,
        enabled: bool,
    ) -> Result<()> {
        self.request(
            "SetSourceFilterEnabled",
            Some(json!({
                "sourceName": source_name,
                "filterName": filter_name,
                "filterEnabled": enabled,
            })),
        )
        .await?;
        Ok(())
    }
}

fn str_of(data: &Value, key: &str) -> Result<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| SyncError::protocol(format!("missing field {key}")))
}

/// Preview-scene requests fail when Studio Mode is off; surface that as
/// `Unsupported` so callers can tolerate it.
fn studio_mode_unsupported(err: SyncError) -> SyncError {
    match err {
        SyncError::ApplyFailed(detail) if detail.contains("studio mode") => {
            SyncError::Unsupported(detail)
        }
        SyncError::ApplyFailed(detail) if detail.contains("Studio mode") => {
            SyncError::Unsupported(detail)
        }
        other => other,
    }
}
