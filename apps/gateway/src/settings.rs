//! On-disk settings shared with the outer web layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use workbench_client::{Query, StartPath};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_visited: Option<StartPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Query>,
}

/// JSON file store. Reads of a missing or corrupt file yield defaults;
/// writes are best-effort and serialized.
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn read(&self) -> Settings {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return Settings::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(error = %err, path = %self.path.display(), "settings file corrupt, using defaults");
                Settings::default()
            }
        }
    }

    pub async fn write(&self, settings: &Settings) {
        let _guard = self.write_lock.lock().await;
        let payload = match serde_json::to_string_pretty(settings) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "settings encode failed");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(&self.path, payload).await {
            tracing::warn!(error = %err, path = %self.path.display(), "settings write failed");
        }
    }
}
