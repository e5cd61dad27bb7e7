//! OBS Studio WebSocket integration
//!
//! Typed client for the obs-websocket v5 protocol (OBS Studio 28+, default
//! port 4455): connect and authenticate, issue requests, and subscribe to the
//! scene / scene-item / input / filter events the sync engine mirrors.

mod client;
mod events;
mod protocol;
mod requests;

pub use client::ObsClient;
pub use events::ObsEvent;
pub use requests::{ObsVersion, SceneItemInfo};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsConnectionConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsConnectionStatus {
    pub connected: bool,
    pub obs_version: Option<String>,
    pub obs_websocket_version: Option<String>,
}

/// Holds the (re)connectable OBS client for the rest of the engine.
///
/// Interior mutability so the gateway can be shared across tasks; a dropped
/// connection is replaced wholesale by `connect`.
pub struct ObsGateway {
    client: RwLock<Option<Arc<ObsClient>>>,
}

impl ObsGateway {
    pub fn new() -> Self {
        Self {
            client: RwLock::new(None),
        }
    }

    pub async fn connect(&self, config: ObsConnectionConfig) -> Result<()> {
        info!("Connecting to OBS at {}:{}", config.host, config.port);
        let client =
            ObsClient::connect(&config.host, config.port, config.password.as_deref()).await?;
        info!(
            "OBS connected (obs-websocket {})",
            client.obs_websocket_version()
        );

        *self.client.write().await = Some(Arc::new(client));
        Ok(())
    }

    /// Idempotent
    pub async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            client.disconnect();
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self.client.read().await.as_ref() {
            Some(client) => client.is_connected(),
            None => false,
        }
    }

    /// The live client, or `NotConnected`
    pub async fn client(&self) -> Result<Arc<ObsClient>> {
        let guard = self.client.read().await;
        match guard.as_ref() {
            Some(client) if client.is_connected() => Ok(Arc::clone(client)),
            _ => Err(SyncError::NotConnected),
        }
    }

    pub async fn status(&self) -> ObsConnectionStatus {
        if let Ok(client) = self.client().await {
            if let Ok(version) = client.version().await {
                return ObsConnectionStatus {
                    connected: true,
                    obs_version: Some(version.obs_version),
                    obs_websocket_version: Some(version.obs_websocket_version),
                };
            }
        }
        ObsConnectionStatus {
            connected: false,
            obs_version: None,
            obs_websocket_version: None,
        }
    }
}

impl Default for ObsGateway {
    fn default() -> Self {
        Self::new()
    }
}
