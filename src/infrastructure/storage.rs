//! Device registry backends: a JSON file in the user's config directory and
//! an in-memory store.

use crate::domain::error::RemoteError;
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::RemoteConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            path: Self::default_path()?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn default_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RideRemote");
        path.push("remotes.json");
        Ok(path)
    }

    /// Reads the document, falling back to defaults when it is missing or
    /// malformed.
    pub fn load_blocking(path: &Path) -> RemoteConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(path, &contents),
            Err(e) => {
                debug!("No readable config at {}: {}", path.display(), e);
                RemoteConfig::default()
            }
        }
    }

    fn parse(path: &Path, contents: &str) -> RemoteConfig {
        match serde_json::from_str::<RemoteConfig>(contents) {
            Ok(mut config) => {
                config.normalize();
                config
            }
            Err(e) => {
                warn!(
                    "Malformed config at {} ({}), using default settings",
                    path.display(),
                    e
                );
                RemoteConfig::default()
            }
        }
    }
}

#[async_trait]
impl DeviceRegistry for JsonFileRegistry {
    async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Self::parse(&self.path, &contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoteConfig::default()),
            Err(e) => {
                warn!("Could not read {}: {}", self.path.display(), e);
                Ok(RemoteConfig::default())
            }
        }
    }

    async fn store(&self, config: &RemoteConfig) -> Result<(), RemoteError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::Configuration(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| RemoteError::Configuration(e.to_string()))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| RemoteError::Configuration(e.to_string()))?;
        debug!("Saved {} remotes to {}", config.devices.len(), self.path.display());
        Ok(())
    }
}

/// Registry held in memory; used by the console harness and tests.
#[derive(Default)]
pub struct MemoryRegistry {
    config: Mutex<RemoteConfig>,
}

impl MemoryRegistry {
    pub fn new(mut config: RemoteConfig) -> Self {
        config.normalize();
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn snapshot(&self) -> RemoteConfig {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        Ok(self.snapshot())
    }

    async fn store(&self, config: &RemoteConfig) -> Result<(), RemoteError> {
        let mut current = self
            .config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = config.clone();
        Ok(())
    }
}
