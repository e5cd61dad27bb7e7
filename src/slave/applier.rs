//! Inbound message application on the slave
//!
//! Consumes messages strictly in arrival order. Every message updates the
//! expected state first and then drives the local OBS. Per-message failures
//! are logged and counted; the session itself is never torn down by a bad
//! message, but a long streak of consecutive failures raises a visible
//! alert.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::ExpectedState;
use super::DesyncAlert;
use crate::error::{Result, SyncError};
use crate::image;
use crate::obs::{ObsClient, ObsGateway};
use crate::protocol::{
    AlertSeverity, FilterUpdatePayload, ImageUpdatePayload, SceneChangePayload,
    SourceUpdateAction, SourceUpdatePayload, StateSyncPayload, SyncMessage, SyncMessageType,
    SyncTargetType, Transform, TransformUpdatePayload, MAX_IMAGE_BYTES,
};

/// Consecutive failures tolerated before alerting
pub const MAX_APPLY_FAILURE_STREAK: u32 = 5;

/// Counts consecutive apply failures; one alert per full streak
#[derive(Debug, Default)]
pub struct FailureStreak {
    count: u32,
}

impl FailureStreak {
    pub fn record_success(&mut self) {
        self.count = 0;
    }

    /// Returns `true` when the streak crosses the threshold; the counter
    /// resets so the next streak alerts again.
    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        if self.count > MAX_APPLY_FAILURE_STREAK {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

pub struct Applier {
    obs: Arc<ObsGateway>,
    expected: Arc<ExpectedState>,
    alert_tx: mpsc::UnboundedSender<DesyncAlert>,
}

impl Applier {
    pub fn new(
        obs: Arc<ObsGateway>,
        expected: Arc<ExpectedState>,
        alert_tx: mpsc::UnboundedSender<DesyncAlert>,
    ) -> Self {
        Self {
            obs,
            expected,
            alert_tx,
        }
    }

    /// Drain the inbound stream until the link hands it back
    pub fn spawn(self, mut inbound: mpsc::UnboundedReceiver<SyncMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut streak = FailureStreak::default();
            while let Some(message) = inbound.recv().await {
                let kind = message.kind;
                match self.apply(message).await {
                    Ok(()) => streak.record_success(),
                    Err(e) => {
                        warn!("Failed to apply {}: {e}", kind.as_str());
                        if streak.record_failure() {
                            self.send_alert(
                                String::new(),
                                String::new(),
                                format!(
                                    "more than {MAX_APPLY_FAILURE_STREAK} consecutive apply failures, last: {e}"
                                ),
                                AlertSeverity::Critical,
                            );
                        }
                    }
                }
            }
            debug!("Applier finished");
        })
    }

    async fn apply(&self, message: SyncMessage) -> Result<()> {
        match message.kind {
            SyncMessageType::SceneChange => {
                let payload: SceneChangePayload = message.parse_payload()?;
                self.apply_scene_change(message.target_type, payload).await
            }
            SyncMessageType::TransformUpdate => {
                let payload: TransformUpdatePayload = message.parse_payload()?;
                self.apply_transform(payload).await
            }
            SyncMessageType::FilterUpdate => {
                let payload: FilterUpdatePayload = message.parse_payload()?;
                self.apply_filter(payload).await
            }
            SyncMessageType::ImageUpdate => {
                let payload: ImageUpdatePayload = message.parse_payload()?;
                self.apply_image(payload).await
            }
            SyncMessageType::SourceUpdate => {
                let payload: SourceUpdatePayload = message.parse_payload()?;
                self.apply_source_update(payload).await
            }
            SyncMessageType::StateSync => {
                let payload: StateSyncPayload = message.parse_payload()?;
                self.apply_snapshot(payload).await
            }
            SyncMessageType::Heartbeat => Ok(()),
            other => {
                debug!("Ignoring inbound {}", other.as_str());
                Ok(())
            }
        }
    }

    async fn apply_scene_change(
        &self,
        target: SyncTargetType,
        payload: SceneChangePayload,
    ) -> Result<()> {
        let client = self.obs.client().await?;
        match target {
            SyncTargetType::Preview => {
                self.expected.set_preview_scene(&payload.scene_name);
                // Tolerated when Studio Mode is off
                if let Err(e) = client.set_current_preview_scene(&payload.scene_name).await {
                    info!(
                        "Preview change to '{}' not applied (Studio Mode off?): {e}",
                        payload.scene_name
                    );
                }
                Ok(())
            }
            _ => {
                self.expected.set_program_scene(&payload.scene_name);
                client.set_current_program_scene(&payload.scene_name).await
            }
        }
    }

    async fn apply_transform(&self, payload: TransformUpdatePayload) -> Result<()> {
        let client = self.obs.client().await?;

        // Master ids are not portable; resolve by source name and fall back
        // to the raw id only when no name was attached.
        let item_id = match &payload.source_name {
            Some(source_name) => {
                self.expected
                    .merge_transform(&payload.scene_name, source_name, &payload.transform);
                client
                    .scene_item_id(&payload.scene_name, source_name)
                    .await
                    .map_err(|_| {
                        SyncError::SceneResolutionFailed(format!(
                            "{}/{}",
                            payload.scene_name, source_name
                        ))
                    })?
            }
            None => {
                debug!(
                    "Transform for {}#{} has no source name, using the raw id",
                    payload.scene_name, payload.scene_item_id
                );
                payload.scene_item_id
            }
        };

        let mut merged = client
            .scene_item_transform(&payload.scene_name, item_id)
            .await?;
        merged.merge_from(&payload.transform);
        client
            .set_scene_item_transform(&payload.scene_name, item_id, &sendable(&merged))
            .await
    }

    async fn apply_filter(&self, payload: FilterUpdatePayload) -> Result<()> {
        let client = self.obs.client().await?;
        self.expected.upsert_filter(
            &payload.scene_name,
            &payload.source_name,
            crate::protocol::FilterSpec {
                name: payload.filter_name.clone(),
                enabled: payload.filter_enabled.unwrap_or(true),
                settings: payload.filter_settings.clone(),
            },
        );

        client
            .set_filter_settings(
                &payload.source_name,
                &payload.filter_name,
                &payload.filter_settings,
                true,
            )
            .await?;
        if let Some(enabled) = payload.filter_enabled {
            client
                .set_filter_enabled(&payload.source_name, &payload.filter_name, enabled)
                .await?;
        }
        Ok(())
    }

    async fn apply_image(&self, payload: ImageUpdatePayload) -> Result<()> {
        let client = self.obs.client().await?;
        let bytes = payload.decode_data(MAX_IMAGE_BYTES)?;
        let path = stage_image(&client, &payload.source_name, &bytes).await?;
        if !payload.scene_name.is_empty() {
            self.expected
                .set_image_path(&payload.scene_name, &payload.source_name, path);
        }
        Ok(())
    }

    async fn apply_source_update(&self, payload: SourceUpdatePayload) -> Result<()> {
        match payload.action {
            SourceUpdateAction::EnabledStateChanged => {
                let Some(enabled) = payload.scene_item_enabled else {
                    return Err(SyncError::malformed(
                        "enabled_state_changed without sceneItemEnabled",
                    ));
                };
                let client = self.obs.client().await?;
                let item_id = client
                    .scene_item_id(&payload.scene_name, &payload.source_name)
                    .await?;
                client
                    .set_scene_item_enabled(&payload.scene_name, item_id, enabled)
                    .await
            }
            // Scene topology stays local
            other => {
                debug!(
                    "Ignoring source_update {:?} for {}/{}",
                    other, payload.scene_name, payload.source_name
                );
                Ok(())
            }
        }
    }

    /// Apply a full snapshot in its defined order: per item transform, then
    /// image, then filters; preview and program scene last so content is in
    /// place before the switch.
    async fn apply_snapshot(&self, payload: StateSyncPayload) -> Result<()> {
        info!(
            "Applying snapshot: {} scene(s), program '{}'",
            payload.scenes.len(),
            payload.current_program_scene
        );
        self.expected.ingest_snapshot(&payload);
        let client = self.obs.client().await?;

        for scene in &payload.scenes {
            for item in &scene.items {
                let item_id = match client.scene_item_id(&scene.name, &item.source_name).await {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(
                            "Snapshot item {}/{} not present locally: {e}",
                            scene.name, item.source_name
                        );
                        continue;
                    }
                };

                if !item.transform.is_empty() {
                    if let Err(e) = client
                        .set_scene_item_transform(&scene.name, item_id, &sendable(&item.transform))
                        .await
                    {
                        warn!(
                            "Snapshot transform for {}/{} failed: {e}",
                            scene.name, item.source_name
                        );
                    }
                }

                if let Some(blob) = &item.image {
                    match crate::protocol::decode_image_data(&blob.data, MAX_IMAGE_BYTES) {
                        Ok(bytes) => match stage_image(&client, &item.source_name, &bytes).await {
                            Ok(path) => {
                                self.expected
                                    .set_image_path(&scene.name, &item.source_name, path);
                            }
                            Err(e) => warn!(
                                "Snapshot image for {} failed: {e}",
                                item.source_name
                            ),
                        },
                        Err(e) => warn!("Snapshot image for {} rejected: {e}", item.source_name),
                    }
                }

                for filter in &item.filters {
                    if let Err(e) = client
                        .set_filter_settings(&item.source_name, &filter.name, &filter.settings, true)
                        .await
                    {
                        warn!(
                            "Snapshot filter {} on {} failed: {e}",
                            filter.name, item.source_name
                        );
                        continue;
                    }
                    if let Err(e) = client
                        .set_filter_enabled(&item.source_name, &filter.name, filter.enabled)
                        .await
                    {
                        warn!(
                            "Snapshot filter {} enable on {} failed: {e}",
                            filter.name, item.source_name
                        );
                    }
                }
            }
        }

        if let Some(preview) = &payload.current_preview_scene {
            if let Err(e) = client.set_current_preview_scene(preview).await {
                info!("Snapshot preview scene not applied (Studio Mode off?): {e}");
            }
        }
        client
            .set_current_program_scene(&payload.current_program_scene)
            .await?;

        info!("Snapshot applied");
        Ok(())
    }

    fn send_alert(
        &self,
        scene_name: String,
        source_name: String,
        message: String,
        severity: AlertSeverity,
    ) {
        let _ = self.alert_tx.send(DesyncAlert::new(
            scene_name,
            source_name,
            message,
            severity,
        ));
    }
}

/// Write image bytes to the staging area and point the input at the file
async fn stage_image(client: &ObsClient, source_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let extension = image::sniff_extension(bytes);
    let path = image::staged_path(source_name, extension);

    tokio::fs::create_dir_all(image::staging_dir()).await?;
    tokio::fs::write(&path, bytes).await?;
    debug!(
        "Staged {} byte(s) for {} at {}",
        bytes.len(),
        source_name,
        path.display()
    );

    let settings = serde_json::json!({ "file": path.to_string_lossy() });
    client.set_input_settings(source_name, &settings, true).await?;
    Ok(path)
}

/// OBS rejects writes to the computed width/height fields; everything else
/// passes through.
fn sendable(transform: &Transform) -> Transform {
    let mut out = transform.clone();
    out.width = None;
    out.height = None;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_streak_alerts_once_per_streak() {
        let mut streak = FailureStreak::default();
        for _ in 0..MAX_APPLY_FAILURE_STREAK {
            assert!(!streak.record_failure());
        }
        // Crossing the threshold alerts and resets
        assert!(streak.record_failure());
        assert!(!streak.record_failure());
    }

    #[test]
    fn test_failure_streak_reset_by_success() {
        let mut streak = FailureStreak::default();
        for _ in 0..MAX_APPLY_FAILURE_STREAK {
            assert!(!streak.record_failure());
        }
        streak.record_success();
        // The count starts over after a success
        for _ in 0..MAX_APPLY_FAILURE_STREAK {
            assert!(!streak.record_failure());
        }
        assert!(streak.record_failure());
    }

    #[test]
    fn test_sendable_strips_computed_fields() {
        let transform = Transform {
            position_x: Some(10.0),
            width: Some(1920.0),
            height: Some(1080.0),
            bounds_width: Some(640.0),
            ..Default::default()
        };
        let out = sendable(&transform);
        assert_eq!(out.position_x, Some(10.0));
        assert_eq!(out.bounds_width, Some(640.0));
        assert_eq!(out.width, None);
        assert_eq!(out.height, None);
    }
}
