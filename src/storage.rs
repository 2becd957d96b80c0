//! Credential storage boundary.
//!
//! The session never touches credentials directly; it talks to a
//! [`CredentialStore`] injected at startup. The store only answers narrow
//! questions: which devices have credentials, for which protocols, and
//! forget-this-device. Credential material itself is written by the pairing
//! layer of the device-control library.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::device::{DeviceError, DeviceResult, ServiceProtocol};

/// Stored per-device settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Opaque credential blob per paired protocol.
    #[serde(default)]
    pub credentials: HashMap<ServiceProtocol, String>,
}

impl DeviceSettings {
    /// Whether any protocol has credentials stored.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.credentials.values().any(|c| !c.is_empty())
    }
}

/// Summary of a remembered device, as reported to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SavedDevice {
    pub identifier: String,
    pub name: String,
    pub protocols: Vec<ServiceProtocol>,
}

/// Narrow interface to wherever credentials live.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads persisted settings. Called once at startup.
    async fn load(&self) -> DeviceResult<()>;

    /// Persists the current settings.
    async fn save(&self) -> DeviceResult<()>;

    /// Settings for one device, if any are stored.
    async fn settings_for(&self, identifier: &str) -> Option<DeviceSettings>;

    /// Drops the settings for one device. Returns whether anything was
    /// removed.
    async fn remove_settings(&self, identifier: &str) -> DeviceResult<bool>;

    /// All devices with at least one stored credential.
    async fn saved_devices(&self) -> Vec<SavedDevice>;
}

/// JSON-file-backed store used by the binary.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Vec<DeviceSettings>>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn load(&self) -> DeviceResult<()> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(DeviceError::Settings(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };

        let entries: Vec<DeviceSettings> = serde_json::from_str(&contents)
            .map_err(|e| DeviceError::Settings(format!("parsing {}: {e}", self.path.display())))?;
        *self.entries.lock().await = entries;
        Ok(())
    }

    async fn save(&self) -> DeviceResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeviceError::Settings(format!("creating {}: {e}", parent.display())))?;
        }

        let entries = self.entries.lock().await;
        let contents = serde_json::to_string_pretty(&*entries)
            .map_err(|e| DeviceError::Settings(e.to_string()))?;
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| DeviceError::Settings(format!("writing {}: {e}", self.path.display())))
    }

    async fn settings_for(&self, identifier: &str) -> Option<DeviceSettings> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|s| s.identifier == identifier)
            .cloned()
    }

    async fn remove_settings(&self, identifier: &str) -> DeviceResult<bool> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|s| s.identifier != identifier);
        Ok(entries.len() != before)
    }

    async fn saved_devices(&self) -> Vec<SavedDevice> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|s| s.is_paired())
            .map(|s| {
                let mut protocols: Vec<ServiceProtocol> = s
                    .credentials
                    .iter()
                    .filter(|(_, c)| !c.is_empty())
                    .map(|(p, _)| *p)
                    .collect();
                protocols.sort_unstable();
                SavedDevice {
                    identifier: s.identifier.clone(),
                    name: s.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                    protocols,
                }
            })
            .collect()
    }
}

/// In-memory store for tests and the simulated backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<DeviceSettings>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with settings, as if pairing had happened earlier.
    pub async fn insert(&self, settings: DeviceSettings) {
        let mut entries = self.entries.lock().await;
        entries.retain(|s| s.identifier != settings.identifier);
        entries.push(settings);
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn save(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn settings_for(&self, identifier: &str) -> Option<DeviceSettings> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|s| s.identifier == identifier)
            .cloned()
    }

    async fn remove_settings(&self, identifier: &str) -> DeviceResult<bool> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|s| s.identifier != identifier);
        Ok(entries.len() != before)
    }

    async fn saved_devices(&self) -> Vec<SavedDevice> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|s| s.is_paired())
            .map(|s| SavedDevice {
                identifier: s.identifier.clone(),
                name: s.name.clone().unwrap_or_else(|| "Unknown".to_string()),
                protocols: s.credentials.keys().copied().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired(identifier: &str, protocol: ServiceProtocol) -> DeviceSettings {
        DeviceSettings {
            identifier: identifier.to_string(),
            name: Some(format!("Device {identifier}")),
            credentials: HashMap::from([(protocol, "blob".to_string())]),
        }
    }

    #[tokio::test]
    async fn empty_credentials_do_not_count_as_paired() {
        let settings = DeviceSettings {
            identifier: "a".into(),
            name: None,
            credentials: HashMap::from([(ServiceProtocol::Companion, String::new())]),
        };
        assert!(!settings.is_paired());
        assert!(paired("a", ServiceProtocol::Mrp).is_paired());
    }

    #[tokio::test]
    async fn memory_store_round_trips_settings() {
        let store = MemoryStore::new();
        store.insert(paired("aa:bb", ServiceProtocol::Companion)).await;

        let found = store.settings_for("aa:bb").await.unwrap();
        assert_eq!(found.identifier, "aa:bb");
        assert_eq!(store.saved_devices().await.len(), 1);

        assert!(store.remove_settings("aa:bb").await.unwrap());
        assert!(!store.remove_settings("aa:bb").await.unwrap());
        assert!(store.settings_for("aa:bb").await.is_none());
    }
}
