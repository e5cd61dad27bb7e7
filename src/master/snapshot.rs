//! Full-state snapshot assembly on the master
//!
//! Walks every scene in OBS order and captures, per item, its transform,
//! filters (settings and enabled flags), and — for image sources — the file
//! bytes. The result is a single self-contained `state_sync` payload that a
//! slave can apply at join or on resync. Per-item failures degrade the
//! snapshot instead of aborting it.

use tracing::{debug, warn};

use crate::error::Result;
use crate::obs::ObsGateway;
use crate::protocol::{
    ImageBlob, ImageUpdatePayload, SceneItemSnapshot, SceneSnapshot, StateSyncPayload,
    MAX_IMAGE_BYTES,
};

pub async fn build_snapshot(obs: &ObsGateway) -> Result<StateSyncPayload> {
    let client = obs.client().await?;

    let current_program_scene = client.current_program_scene().await?;
    // Absent outside Studio Mode
    let current_preview_scene = client.current_preview_scene().await.ok();

    let mut scenes = Vec::new();
    for scene_name in client.list_scenes().await? {
        let items = match client.list_scene_items(&scene_name).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Skipping scene {scene_name} in snapshot: {e}");
                continue;
            }
        };

        let mut snapshot_items = Vec::with_capacity(items.len());
        for item in items {
            let transform = match client
                .scene_item_transform(&scene_name, item.scene_item_id)
                .await
            {
                Ok(transform) => transform,
                Err(e) => {
                    warn!(
                        "No transform for {}/{} in snapshot: {e}",
                        scene_name, item.source_name
                    );
                    Default::default()
                }
            };

            let filters = client
                .list_filters(&item.source_name)
                .await
                .unwrap_or_else(|e| {
                    debug!("No filters for {} in snapshot: {e}", item.source_name);
                    Vec::new()
                });

            let source_type = item.input_kind.clone().unwrap_or_else(|| "unknown".into());
            let image = if source_type.starts_with("image_") {
                read_image_blob(obs, &item.source_name).await
            } else {
                None
            };

            snapshot_items.push(SceneItemSnapshot {
                source_name: item.source_name,
                source_type,
                transform,
                filters,
                image,
            });
        }

        scenes.push(SceneSnapshot {
            name: scene_name,
            items: snapshot_items,
        });
    }

    Ok(StateSyncPayload {
        current_program_scene,
        current_preview_scene,
        scenes,
    })
}

/// File bytes of an image source, or `None` when unreadable or over the cap
async fn read_image_blob(obs: &ObsGateway, source_name: &str) -> Option<ImageBlob> {
    let client = obs.client().await.ok()?;
    let (_, settings) = client.input_settings(source_name).await.ok()?;
    let file = settings.get("file")?.as_str()?.to_string();

    let bytes = match tokio::fs::read(&file).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Cannot read image file {file} for snapshot: {e}");
            return None;
        }
    };
    if bytes.len() > MAX_IMAGE_BYTES {
        warn!(
            "Image {file} ({} bytes) exceeds the {} byte cap, omitting from snapshot",
            bytes.len(),
            MAX_IMAGE_BYTES
        );
        return None;
    }

    Some(ImageBlob {
        source_path: file,
        data: ImageUpdatePayload::encode_data(&bytes),
    })
}
