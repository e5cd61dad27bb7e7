//! Drift detection on the slave
//!
//! Every cycle, while connected and an expected state exists, the local OBS
//! is polled and compared against the master-originated projection. Scene
//! mismatches are critical; missing sources and transform deviations beyond
//! tolerance are warnings. Filter settings and image content are not
//! checked — the former are opaque, the latter can differ legitimately
//! between runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::state::{ExpectedSnapshot, ExpectedState};
use super::DesyncAlert;
use crate::metrics::MetricsRecorder;
use crate::obs::ObsGateway;
use crate::protocol::{
    AlertSeverity, DesyncDetail, DriftCategory, SlaveStatusReportPayload, SyncMessage,
    SyncMessageType, SyncTargetType, Transform,
};

/// Check cadence; status reports are implicitly coalesced to this rate
pub const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Allowed deviation on continuous transform fields
pub const TRANSFORM_TOLERANCE: f64 = 0.5;

/// What the drift cycle observed locally
#[derive(Debug, Default)]
pub struct LocalObservation {
    pub program_scene: String,
    pub preview_scene: Option<String>,
    /// `None` marks a source that could not be resolved in its scene
    pub transforms: HashMap<(String, String), Option<Transform>>,
}

/// Names of the transform fields that deviate beyond tolerance.
///
/// Continuous fields compare within `tolerance`; discrete fields compare
/// exactly. Fields absent on either side are not compared.
pub fn transform_drift_fields(
    expected: &Transform,
    actual: &Transform,
    tolerance: f64,
) -> Vec<&'static str> {
    let mut fields = Vec::new();

    let mut continuous = |name, e: Option<f64>, a: Option<f64>| {
        if let (Some(e), Some(a)) = (e, a) {
            if (e - a).abs() > tolerance {
                fields.push(name);
            }
        }
    };
    continuous("positionX", expected.position_x, actual.position_x);
    continuous("positionY", expected.position_y, actual.position_y);
    continuous("rotation", expected.rotation, actual.rotation);
    continuous("scaleX", expected.scale_x, actual.scale_x);
    continuous("scaleY", expected.scale_y, actual.scale_y);
    continuous("width", expected.width, actual.width);
    continuous("height", expected.height, actual.height);
    continuous("boundsWidth", expected.bounds_width, actual.bounds_width);
    continuous("boundsHeight", expected.bounds_height, actual.bounds_height);

    if let (Some(e), Some(a)) = (expected.alignment, actual.alignment) {
        if e != a {
            fields.push("alignment");
        }
    }
    if let (Some(e), Some(a)) = (expected.bounds_alignment, actual.bounds_alignment) {
        if e != a {
            fields.push("boundsAlignment");
        }
    }
    if let (Some(e), Some(a)) = (&expected.bounds_type, &actual.bounds_type) {
        if e != a {
            fields.push("boundsType");
        }
    }

    fields
}

/// Compare one observation against the expected projection
pub fn compare_states(expected: &ExpectedSnapshot, local: &LocalObservation) -> Vec<DesyncDetail> {
    let mut details = Vec::new();

    if let Some(expected_program) = &expected.program_scene {
        if expected_program != &local.program_scene {
            details.push(DesyncDetail {
                category: DriftCategory::SceneMismatch,
                scene_name: expected_program.clone(),
                source_name: String::new(),
                description: format!(
                    "program scene is '{}', expected '{}'",
                    local.program_scene, expected_program
                ),
                severity: AlertSeverity::Critical,
            });
        }
    }

    // Preview only compares when the slave has one (Studio Mode on)
    if let (Some(expected_preview), Some(local_preview)) =
        (&expected.preview_scene, &local.preview_scene)
    {
        if expected_preview != local_preview {
            details.push(DesyncDetail {
                category: DriftCategory::SceneMismatch,
                scene_name: expected_preview.clone(),
                source_name: String::new(),
                description: format!(
                    "preview scene is '{local_preview}', expected '{expected_preview}'"
                ),
                severity: AlertSeverity::Critical,
            });
        }
    }

    for ((scene_name, source_name), item) in &expected.items {
        match local.transforms.get(&(scene_name.clone(), source_name.clone())) {
            Some(Some(actual)) => {
                let fields =
                    transform_drift_fields(&item.transform, actual, TRANSFORM_TOLERANCE);
                if !fields.is_empty() {
                    details.push(DesyncDetail {
                        category: DriftCategory::TransformMismatch,
                        scene_name: scene_name.clone(),
                        source_name: source_name.clone(),
                        description: format!("transform differs on {}", fields.join(", ")),
                        severity: AlertSeverity::Warning,
                    });
                }
            }
            _ => {
                details.push(DesyncDetail {
                    category: DriftCategory::SourceMissing,
                    scene_name: scene_name.clone(),
                    source_name: source_name.clone(),
                    description: format!("source '{source_name}' is missing from '{scene_name}'"),
                    severity: AlertSeverity::Warning,
                });
            }
        }
    }

    details
}

pub struct DriftDetector {
    obs: Arc<ObsGateway>,
    expected: Arc<ExpectedState>,
    alert_tx: mpsc::UnboundedSender<DesyncAlert>,
    /// Feeds `slave_status_report`s back to the master
    report_tx: mpsc::UnboundedSender<SyncMessage>,
    metrics: Arc<MetricsRecorder>,
}

impl DriftDetector {
    pub fn new(
        obs: Arc<ObsGateway>,
        expected: Arc<ExpectedState>,
        alert_tx: mpsc::UnboundedSender<DesyncAlert>,
        report_tx: mpsc::UnboundedSender<SyncMessage>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            obs,
            expected,
            alert_tx,
            report_tx,
            metrics,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRIFT_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_cycle().await {
                    debug!("Drift cycle skipped: {e}");
                }
            }
            debug!("Drift detector stopped");
        })
    }

    async fn run_cycle(&self) -> crate::error::Result<()> {
        let expected = self.expected.snapshot();
        if expected.is_empty() {
            return Ok(());
        }

        let local = self.observe(&expected).await?;
        let details = compare_states(&expected, &local);

        let report = SyncMessage::with_payload(
            SyncMessageType::SlaveStatusReport,
            SyncTargetType::Program,
            &SlaveStatusReportPayload {
                is_synced: details.is_empty(),
                desync_details: details.clone(),
            },
        )?;
        let byte_count = report.encode().map(|t| t.len()).unwrap_or(0);
        if self.report_tx.send(report).is_ok() {
            self.metrics.record("slave_status_report", 0.0, byte_count);
        }

        if !details.is_empty() {
            warn!("Detected {} drift issue(s)", details.len());
        }
        for detail in details {
            let _ = self.alert_tx.send(DesyncAlert::new(
                detail.scene_name,
                detail.source_name,
                detail.description,
                detail.severity,
            ));
        }
        Ok(())
    }

    async fn observe(&self, expected: &ExpectedSnapshot) -> crate::error::Result<LocalObservation> {
        let client = self.obs.client().await?;

        let program_scene = client.current_program_scene().await?;
        // No preview to compare against when Studio Mode is off locally
        let preview_scene = if client.studio_mode_enabled().await.unwrap_or(false) {
            client.current_preview_scene().await.ok()
        } else {
            None
        };

        let mut transforms = HashMap::new();
        for (scene_name, source_name) in expected.items.keys() {
            let observed = match client.scene_item_id(scene_name, source_name).await {
                Ok(item_id) => client
                    .scene_item_transform(scene_name, item_id)
                    .await
                    .ok(),
                Err(_) => None,
            };
            transforms.insert((scene_name.clone(), source_name.clone()), observed);
        }

        Ok(LocalObservation {
            program_scene,
            preview_scene,
            transforms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::state::ItemState;

    fn full_transform(x: f64, y: f64) -> Transform {
        Transform {
            position_x: Some(x),
            position_y: Some(y),
            rotation: Some(0.0),
            scale_x: Some(1.0),
            scale_y: Some(1.0),
            alignment: Some(5),
            ..Default::default()
        }
    }

    fn expected_with_item(scene: &str, source: &str, transform: Transform) -> ExpectedSnapshot {
        let mut snapshot = ExpectedSnapshot {
            program_scene: Some("Main".into()),
            ..Default::default()
        };
        snapshot.items.insert(
            (scene.to_string(), source.to_string()),
            ItemState {
                transform,
                ..Default::default()
            },
        );
        snapshot
    }

    fn observation_with_item(scene: &str, source: &str, transform: Transform) -> LocalObservation {
        let mut local = LocalObservation {
            program_scene: "Main".into(),
            ..Default::default()
        };
        local
            .transforms
            .insert((scene.to_string(), source.to_string()), Some(transform));
        local
    }

    #[test]
    fn test_within_tolerance_is_silent() {
        let expected = full_transform(100.0, 200.0);
        let actual = full_transform(100.4, 199.6);
        assert!(transform_drift_fields(&expected, &actual, TRANSFORM_TOLERANCE).is_empty());
    }

    #[test]
    fn test_beyond_tolerance_names_the_field() {
        let expected = full_transform(100.0, 200.0);
        let actual = full_transform(100.0, 210.0);
        assert_eq!(
            transform_drift_fields(&expected, &actual, TRANSFORM_TOLERANCE),
            vec!["positionY"]
        );
    }

    #[test]
    fn test_discrete_fields_compare_exactly() {
        let mut expected = full_transform(0.0, 0.0);
        let mut actual = full_transform(0.0, 0.0);
        expected.alignment = Some(5);
        actual.alignment = Some(4);
        expected.bounds_type = Some("OBS_BOUNDS_NONE".into());
        actual.bounds_type = Some("OBS_BOUNDS_STRETCH".into());

        let fields = transform_drift_fields(&expected, &actual, TRANSFORM_TOLERANCE);
        assert!(fields.contains(&"alignment"));
        assert!(fields.contains(&"boundsType"));
    }

    #[test]
    fn test_absent_fields_are_not_compared() {
        let expected = Transform {
            position_x: Some(10.0),
            ..Default::default()
        };
        let actual = Transform {
            position_x: Some(10.0),
            bounds_width: Some(640.0),
            ..Default::default()
        };
        assert!(transform_drift_fields(&expected, &actual, TRANSFORM_TOLERANCE).is_empty());
    }

    #[test]
    fn test_one_warning_per_drifted_item_per_cycle() {
        let expected = expected_with_item("Main", "Cam", full_transform(0.0, 0.0));
        // Moved out-of-band by 10 px
        let local = observation_with_item("Main", "Cam", full_transform(10.0, 0.0));

        let details = compare_states(&expected, &local);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].category, DriftCategory::TransformMismatch);
        assert_eq!(details[0].severity, AlertSeverity::Warning);
        assert_eq!(details[0].scene_name, "Main");
        assert_eq!(details[0].source_name, "Cam");
        assert!(details[0].description.contains("positionX"));
    }

    #[test]
    fn test_program_scene_mismatch_is_critical() {
        let expected = expected_with_item("Main", "Cam", full_transform(0.0, 0.0));
        let mut local = observation_with_item("Main", "Cam", full_transform(0.0, 0.0));
        local.program_scene = "Intermission".into();

        let details = compare_states(&expected, &local);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].category, DriftCategory::SceneMismatch);
        assert_eq!(details[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_missing_source_is_warning() {
        let expected = expected_with_item("Main", "Cam", full_transform(0.0, 0.0));
        let mut local = LocalObservation {
            program_scene: "Main".into(),
            ..Default::default()
        };
        // The observation has no entry at all for the item
        local.transforms.clear();

        let details = compare_states(&expected, &local);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].category, DriftCategory::SourceMissing);
        assert_eq!(details[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_in_sync_produces_no_details() {
        let expected = expected_with_item("Main", "Cam", full_transform(100.0, 200.0));
        let local = observation_with_item("Main", "Cam", full_transform(100.2, 200.1));
        assert!(compare_states(&expected, &local).is_empty());
    }
}
