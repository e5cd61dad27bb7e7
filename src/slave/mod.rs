//! Slave role: upstream link, message application, and drift detection

pub mod applier;
pub mod drift;
pub mod link;
pub mod state;

pub use applier::Applier;
pub use drift::DriftDetector;
pub use link::{MasterLink, ReconnectionStatus};
pub use state::ExpectedState;

use serde::{Deserialize, Serialize};

use crate::protocol::AlertSeverity;

/// Drift or apply problem surfaced to the shell's alert panel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesyncAlert {
    pub id: String,
    pub timestamp: i64,
    pub scene_name: String,
    pub source_name: String,
    pub message: String,
    pub severity: AlertSeverity,
}

impl DesyncAlert {
    pub fn new(
        scene_name: String,
        source_name: String,
        message: String,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            scene_name,
            source_name,
            message,
            severity,
        }
    }
}
