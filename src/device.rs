//! Per-device persisted configuration.
//!
//! Small JSON blobs keyed by the `device-id` header: which role the device
//! last selected, who owns it, when it last chatted. Best-effort storage;
//! a missing or corrupt blob just means defaults.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted state for one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Role selected by the device, restored on reconnect.
    pub current_role: Option<String>,
    /// Speaker id enrolled as the device owner/admin.
    pub owner_speaker_id: Option<String>,
    /// Unix timestamp of the last conversation.
    pub last_chat_at: Option<i64>,
}

/// JSON-file store for [`DeviceConfig`] blobs.
pub struct DeviceStore {
    root: PathBuf,
}

impl DeviceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, device_id: &str) -> PathBuf {
        let safe: String = device_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join("devices").join(format!("{safe}.json"))
    }

    /// Load the device's config, falling back to defaults.
    pub fn load_or_create(&self, device_id: &str) -> DeviceConfig {
        let path = self.path_for(device_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("device config at {} is corrupt: {e}", path.display());
                DeviceConfig::default()
            }),
            Err(_) => DeviceConfig::default(),
        }
    }

    /// Persist, best-effort.
    pub fn save(&self, device_id: &str, config: &DeviceConfig) {
        let path = self.path_for(device_id);
        if let Err(e) = write_json(&path, config) {
            debug!("device config persist failed: {e}");
        }
    }

    /// Stamp the last-chat time.
    pub fn touch_last_chat(&self, device_id: &str) {
        let mut config = self.load_or_create(device_id);
        config.last_chat_at = Some(Utc::now().timestamp());
        self.save(device_id, &config);
    }
}

fn write_json(path: &Path, config: &DeviceConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}
