use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads; the file is only touched on load
/// and on update.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load the configuration, writing defaults if the file does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::write_file(path, &config).await?;
                info!("Wrote default configuration to {}", path.display());
                config
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::new(path.to_path_buf(), config))
    }

    /// Wrap an already-built configuration without reading the file
    pub fn new(path: PathBuf, config: AppConfig) -> Self {
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    async fn write_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the in-memory configuration without persisting it
    pub fn set_in_memory(&self, config: AppConfig) {
        self.cache.store(Arc::new(config));
    }

    /// Update configuration with a closure and persist it
    ///
    /// Read-modify-write; concurrent updates are last-writer-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.cache.load_full()).clone();
        f(&mut config);
        Self::write_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("bridge.json");

        let store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store.get().web.http_port, 8080);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.json");

        let store = ConfigStore::load(&path).await.unwrap();
        store
            .update(|config| config.robot.connect_timeout_secs = 9)
            .await
            .unwrap();
        assert_eq!(store.get().robot.connect_timeout_secs, 9);

        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().robot.connect_timeout_secs, 9);
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let result = ConfigStore::load(&path).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
