//! Persisted application settings
//!
//! One JSON record at the per-user config path holding OBS connection
//! defaults, the master's default port, and the slave's default master
//! address. Missing file means defaults; the directory is created lazily on
//! first save.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

const SETTINGS_DIR: &str = "obs-sync-gw";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub obs: ObsSettings,
    pub master: MasterSettings,
    pub slave: SlaveSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObsSettings {
    pub host: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MasterSettings {
    pub default_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaveSettings {
    pub default_host: String,
    pub default_port: u16,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            obs: ObsSettings {
                host: "localhost".to_string(),
                port: 4455,
                password: String::new(),
            },
            master: MasterSettings { default_port: 8080 },
            slave: SlaveSettings {
                default_host: "192.168.1.100".to_string(),
                default_port: 8080,
            },
        }
    }
}

/// `<user config dir>/obs-sync-gw/settings.json`
pub fn settings_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| SyncError::apply("no user config directory available".to_string()))?;
    Ok(base.join(SETTINGS_DIR).join(SETTINGS_FILE))
}

pub async fn load() -> Result<AppSettings> {
    load_from(&settings_path()?).await
}

pub async fn load_from(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content)
        .map_err(|e| SyncError::apply(format!("settings file is unreadable: {e}")))
}

pub async fn save(settings: &AppSettings) -> Result<()> {
    save_to(&settings_path()?, settings).await
}

pub async fn save_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| SyncError::apply(format!("failed to serialize settings: {e}")))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
