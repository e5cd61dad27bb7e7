//! OBS event → sync message translation on the master
//!
//! Watches the OBS event stream and turns events into broadcastable sync
//! messages, honoring the operator's target-type filter. Filter events only
//! carry a source name, so the hosting scene is resolved by walking the
//! scene list; unresolvable events are dropped with a warning and never
//! retried.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::server::MasterServer;
use crate::error::{Result, SyncError};
use crate::obs::{ObsEvent, ObsGateway};
use crate::protocol::{
    FilterUpdatePayload, ImageUpdatePayload, SceneChangePayload, SyncMessage, SyncMessageType,
    SyncTargetType, TransformUpdatePayload, MAX_IMAGE_BYTES,
};

/// Operator-mutable set of event classes the master propagates.
///
/// Changes take effect on the next event; messages whose target type is not
/// in the set are dropped before they ever reach a session queue.
#[derive(Clone)]
pub struct SyncTargets {
    inner: Arc<parking_lot::RwLock<HashSet<SyncTargetType>>>,
}

impl SyncTargets {
    /// Default set: {Source, Program}
    pub fn new() -> Self {
        let mut set = HashSet::new();
        set.insert(SyncTargetType::Source);
        set.insert(SyncTargetType::Program);
        Self {
            inner: Arc::new(parking_lot::RwLock::new(set)),
        }
    }

    pub fn contains(&self, target: SyncTargetType) -> bool {
        self.inner.read().contains(&target)
    }

    pub fn replace(&self, targets: Vec<SyncTargetType>) {
        *self.inner.write() = targets.into_iter().collect();
    }

    pub fn get(&self) -> Vec<SyncTargetType> {
        self.inner.read().iter().copied().collect()
    }
}

impl Default for SyncTargets {
    fn default() -> Self {
        Self::new()
    }
}

/// The target class an event belongs to, or `None` for events the current
/// filter drops
pub fn gate_event(targets: &SyncTargets, event: &ObsEvent) -> Option<SyncTargetType> {
    let target = match event {
        ObsEvent::ProgramSceneChanged { .. } => SyncTargetType::Program,
        ObsEvent::PreviewSceneChanged { .. } => SyncTargetType::Preview,
        ObsEvent::SceneItemTransformChanged { .. }
        | ObsEvent::FilterSettingsChanged { .. }
        | ObsEvent::InputSettingsChanged { .. } => SyncTargetType::Source,
    };
    targets.contains(target).then_some(target)
}

pub struct EventTranslator {
    obs: Arc<ObsGateway>,
    server: Arc<MasterServer>,
    targets: SyncTargets,
    max_image_bytes: usize,
}

impl EventTranslator {
    pub fn new(obs: Arc<ObsGateway>, server: Arc<MasterServer>, targets: SyncTargets) -> Self {
        Self {
            obs,
            server,
            targets,
            max_image_bytes: MAX_IMAGE_BYTES,
        }
    }

    /// Consume the OBS event stream until it closes
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<ObsEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.handle_event(event).await {
                    warn!("Dropping OBS event: {e}");
                }
            }
            info!("OBS event stream closed, translator stopping");
        })
    }

    async fn handle_event(&self, event: ObsEvent) -> Result<()> {
        let Some(target) = gate_event(&self.targets, &event) else {
            return Ok(());
        };

        match event {
            ObsEvent::ProgramSceneChanged { scene_name }
            | ObsEvent::PreviewSceneChanged { scene_name } => {
                let message = SyncMessage::with_payload(
                    SyncMessageType::SceneChange,
                    target,
                    &SceneChangePayload { scene_name },
                )?;
                self.server.broadcast(message);
            }

            ObsEvent::SceneItemTransformChanged {
                scene_name,
                scene_item_id,
                transform,
            } => {
                // Attach the source name so slaves can resolve their local
                // item id; master ids are not portable.
                let source_name = self
                    .source_name_of_item(&scene_name, scene_item_id)
                    .await
                    .ok();
                let message = SyncMessage::with_payload(
                    SyncMessageType::TransformUpdate,
                    target,
                    &TransformUpdatePayload {
                        scene_name,
                        scene_item_id,
                        source_name,
                        transform,
                    },
                )?;
                self.server.broadcast(message);
            }

            ObsEvent::FilterSettingsChanged {
                source_name,
                filter_name,
                filter_settings,
            } => {
                let (scene_name, scene_item_id) = self.resolve_hosting_scene(&source_name).await?;
                // The event has no enabled flag; read it so slaves converge
                let filter_enabled = match self.obs.client().await {
                    Ok(client) => client
                        .filter_settings(&source_name, &filter_name)
                        .await
                        .ok()
                        .map(|f| f.enabled),
                    Err(_) => None,
                };

                let message = SyncMessage::with_payload(
                    SyncMessageType::FilterUpdate,
                    target,
                    &FilterUpdatePayload {
                        scene_name,
                        scene_item_id,
                        source_name,
                        filter_name,
                        filter_settings,
                        filter_enabled,
                    },
                )?;
                self.server.broadcast(message);
            }

            ObsEvent::InputSettingsChanged {
                input_name,
                settings: _,
            } => {
                let client = self.obs.client().await?;
                let (kind, settings) = client.input_settings(&input_name).await?;
                if !kind.starts_with("image_") {
                    debug!("Ignoring settings change of non-image input {input_name}");
                    return Ok(());
                }
                let Some(file) = settings.get("file").and_then(|v| v.as_str()) else {
                    debug!("Image input {input_name} has no file set");
                    return Ok(());
                };

                let bytes = tokio::fs::read(file).await.map_err(|e| {
                    SyncError::apply(format!("failed to read image {file}: {e}"))
                })?;
                if bytes.len() > self.max_image_bytes {
                    return Err(SyncError::ImageTooLarge {
                        size: bytes.len(),
                        limit: self.max_image_bytes,
                    });
                }

                let scene_name = self
                    .resolve_hosting_scene(&input_name)
                    .await
                    .map(|(scene, _)| scene)
                    .unwrap_or_default();
                let message = SyncMessage::with_payload(
                    SyncMessageType::ImageUpdate,
                    target,
                    &ImageUpdatePayload {
                        scene_name,
                        source_name: input_name,
                        file: file.to_string(),
                        data: ImageUpdatePayload::encode_data(&bytes),
                        width: None,
                        height: None,
                    },
                )?;
                self.server.broadcast(message);
            }
        }
        Ok(())
    }

    /// First (scene, item id) hosting the named source
    async fn resolve_hosting_scene(&self, source_name: &str) -> Result<(String, i64)> {
        let client = self.obs.client().await?;
        for scene in client.list_scenes().await? {
            let items = match client.list_scene_items(&scene).await {
                Ok(items) => items,
                Err(e) => {
                    debug!("Skipping scene {scene} while resolving {source_name}: {e}");
                    continue;
                }
            };
            if let Some(item) = items.iter().find(|i| i.source_name == source_name) {
                return Ok((scene, item.scene_item_id));
            }
        }
        Err(SyncError::SceneResolutionFailed(source_name.to_string()))
    }

    async fn source_name_of_item(&self, scene_name: &str, scene_item_id: i64) -> Result<String> {
        let client = self.obs.client().await?;
        client
            .list_scene_items(scene_name)
            .await?
            .into_iter()
            .find(|i| i.scene_item_id == scene_item_id)
            .map(|i| i.source_name)
            .ok_or_else(|| {
                SyncError::SceneResolutionFailed(format!("{scene_name}/{scene_item_id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Transform;

    fn transform_event() -> ObsEvent {
        ObsEvent::SceneItemTransformChanged {
            scene_name: "Main".into(),
            scene_item_id: 3,
            transform: Transform::default(),
        }
    }

    #[test]
    fn test_default_targets() {
        let targets = SyncTargets::new();
        assert!(targets.contains(SyncTargetType::Source));
        assert!(targets.contains(SyncTargetType::Program));
        assert!(!targets.contains(SyncTargetType::Preview));
    }

    #[test]
    fn test_gate_event_respects_targets() {
        let targets = SyncTargets::new();

        assert_eq!(
            gate_event(
                &targets,
                &ObsEvent::ProgramSceneChanged {
                    scene_name: "Main".into()
                }
            ),
            Some(SyncTargetType::Program)
        );
        assert_eq!(gate_event(&targets, &transform_event()), Some(SyncTargetType::Source));
        // Preview is not in the default set
        assert_eq!(
            gate_event(
                &targets,
                &ObsEvent::PreviewSceneChanged {
                    scene_name: "Main".into()
                }
            ),
            None
        );
    }

    #[test]
    fn test_gate_event_after_replace() {
        let targets = SyncTargets::new();
        targets.replace(vec![SyncTargetType::Preview]);

        assert_eq!(gate_event(&targets, &transform_event()), None);
        assert_eq!(
            gate_event(
                &targets,
                &ObsEvent::PreviewSceneChanged {
                    scene_name: "Main".into()
                }
            ),
            Some(SyncTargetType::Preview)
        );
        assert_eq!(
            gate_event(
                &targets,
                &ObsEvent::ProgramSceneChanged {
                    scene_name: "Main".into()
                }
            ),
            None
        );
    }
}
