//! Persisted outcome of a successful setup
//!
//! Only the desired configuration survives a restart. Setup sessions
//! themselves are never written to disk.

use crate::engine::{ComputeConfig, LaunchConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write settings {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The model and engine the service should run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredConfig {
    pub model_id: String,
    #[serde(flatten)]
    pub compute: ComputeConfig,
    pub gpu_layers: u32,
    /// Start the service automatically on next launch
    #[serde(default)]
    pub auto_start: bool,
    pub updated_at: DateTime<Utc>,
}

impl DesiredConfig {
    pub fn new(launch: &LaunchConfig, auto_start: bool) -> Self {
        Self {
            model_id: launch.model_id.clone(),
            compute: launch.compute,
            gpu_layers: launch.gpu_layers,
            auto_start,
            updated_at: Utc::now(),
        }
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig::new(self.model_id.clone(), self.compute, self.gpu_layers)
    }
}

/// Read/write access to the desired configuration.
///
/// Callers read through this on every use instead of caching a copy, so a
/// value changed elsewhere is always seen.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Option<DesiredConfig>, SettingsError>;

    fn save(&self, config: &DesiredConfig) -> Result<(), SettingsError>;
}

/// JSON file written via temp file + rename
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<Option<DesiredConfig>, SettingsError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SettingsError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let config = serde_json::from_str(&raw).map_err(|source| SettingsError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(config))
    }

    fn save(&self, config: &DesiredConfig) -> Result<(), SettingsError> {
        let write_err = |source| SettingsError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let body = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        debug!(path = %self.path.display(), model = %config.model_id, "Saved desired configuration");
        Ok(())
    }
}

/// In-memory store, for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<Option<DesiredConfig>>,
}

impl MemorySettingsStore {
    pub fn new(initial: Option<DesiredConfig>) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    /// Replaces the value as if another part of the app had edited settings
    pub fn set(&self, config: Option<DesiredConfig>) {
        match self.inner.lock() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Option<DesiredConfig>, SettingsError> {
        Ok(match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        })
    }

    fn save(&self, config: &DesiredConfig) -> Result<(), SettingsError> {
        self.set(Some(config.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GpuBackend, REFERENCE_MODEL_ID};
    use tempfile::TempDir;

    fn sample() -> DesiredConfig {
        DesiredConfig::new(
            &LaunchConfig::new(
                REFERENCE_MODEL_ID,
                ComputeConfig::hybrid(GpuBackend::Vulkan),
                20,
            ),
            true,
        )
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("settings.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("nested/settings.json"));
        let config = sample();
        store.save(&config).unwrap();
        assert_eq!(store.load().unwrap(), Some(config));
        assert!(!dir.path().join("nested/settings.json.tmp").exists());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["modelId"], REFERENCE_MODEL_ID);
        assert_eq!(json["computeMode"], "hybrid");
        assert_eq!(json["gpuBackend"], "vulkan");
        assert_eq!(json["gpuLayers"], 20);
        assert_eq!(json["autoStart"], true);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonSettingsStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SettingsError::Corrupt { .. }));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemorySettingsStore::default();
        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap().unwrap().gpu_layers, 20);
        store.set(None);
        assert!(store.load().unwrap().is_none());
    }
}
