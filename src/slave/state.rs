//! Expected state on the slave
//!
//! The cumulative projection of everything the master has told this slave:
//! current program scene, optional preview scene, and the last-known
//! transform, filters, and staged image path per (scene, source). The
//! applier is the only writer; the drift detector reads copy-on-read
//! snapshots. Retained across momentary disconnects.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

use crate::protocol::{FilterSpec, StateSyncPayload, Transform};

/// Last-known state of one placed source
#[derive(Debug, Clone, Default)]
pub struct ItemState {
    pub transform: Transform,
    pub filters: Vec<FilterSpec>,
    pub image_path: Option<PathBuf>,
}

/// A point-in-time copy handed to readers
#[derive(Debug, Clone, Default)]
pub struct ExpectedSnapshot {
    pub program_scene: Option<String>,
    pub preview_scene: Option<String>,
    /// Keyed by (scene name, source name); scene-item ids are local to each
    /// OBS instance and never stored here
    pub items: HashMap<(String, String), ItemState>,
}

impl ExpectedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.program_scene.is_none() && self.preview_scene.is_none() && self.items.is_empty()
    }
}

pub struct ExpectedState {
    inner: RwLock<ExpectedSnapshot>,
}

impl ExpectedState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ExpectedSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> ExpectedSnapshot {
        self.inner.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn set_program_scene(&self, scene_name: &str) {
        self.inner.write().program_scene = Some(scene_name.to_string());
    }

    pub fn set_preview_scene(&self, scene_name: &str) {
        self.inner.write().preview_scene = Some(scene_name.to_string());
    }

    /// Overlay a (possibly partial) transform onto the stored one
    pub fn merge_transform(&self, scene_name: &str, source_name: &str, update: &Transform) {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .entry((scene_name.to_string(), source_name.to_string()))
            .or_default();
        item.transform.merge_from(update);
    }

    /// Replace a filter by name, keeping list order for known filters
    pub fn upsert_filter(&self, scene_name: &str, source_name: &str, filter: FilterSpec) {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .entry((scene_name.to_string(), source_name.to_string()))
            .or_default();
        match item.filters.iter_mut().find(|f| f.name == filter.name) {
            Some(existing) => *existing = filter,
            None => item.filters.push(filter),
        }
    }

    pub fn set_image_path(&self, scene_name: &str, source_name: &str, path: PathBuf) {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .entry((scene_name.to_string(), source_name.to_string()))
            .or_default();
        item.image_path = Some(path);
    }

    /// Replace the whole projection with a snapshot's content. Image paths
    /// are filled in by the applier as it stages each blob.
    pub fn ingest_snapshot(&self, payload: &StateSyncPayload) {
        let mut items = HashMap::new();
        for scene in &payload.scenes {
            for item in &scene.items {
                items.insert(
                    (scene.name.clone(), item.source_name.clone()),
                    ItemState {
                        transform: item.transform.clone(),
                        filters: item.filters.clone(),
                        image_path: None,
                    },
                );
            }
        }

        let mut inner = self.inner.write();
        inner.program_scene = Some(payload.current_program_scene.clone());
        inner.preview_scene = payload.current_preview_scene.clone();
        inner.items = items;
    }
}

impl Default for ExpectedState {
    fn default() -> Self {
        Self::new()
    }
}
