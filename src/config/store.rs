use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by an optional TOML file
///
/// Uses `ArcSwap` for lock-free reads.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// In-memory store (nothing is persisted)
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_path(None, config)
    }

    fn with_path(path: Option<PathBuf>, config: AppConfig) -> Result<Self> {
        config.validate()?;
        let (change_tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Load `path`, writing the defaults there first if it does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str::<AppConfig>(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::write_file(path, &config).await?;
                info!("Wrote default configuration to {}", path.display());
                config
            }
            Err(e) => return Err(e.into()),
        };
        Self::with_path(Some(path.to_path_buf()), config)
    }

    async fn write_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let text = toml::to_string_pretty(config).map_err(|e| AppError::Config(e.to_string()))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration; persisted before it becomes visible
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        if let Some(path) = &self.path {
            Self::write_file(path, &config).await?;
        }
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
        Ok(())
    }

    /// Read-modify-write; concurrent updates are last-write-wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("talkstick").join("config.toml");

        // missing file: defaults are written out
        let store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(*store.get(), AppConfig::default());
        assert!(path.exists());

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.session.display_name = "Ana".to_string();
                c.mesh.port = 50000;
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "app_config");

        let config = store.get();
        assert_eq!(config.session.display_name, "Ana");

        // reload and verify persistence
        let store2 = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store2.get().session.display_name, "Ana");
        assert_eq!(store2.get().mesh.port, 50000);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let store = ConfigStore::new(AppConfig::default()).unwrap();
        let result = store.update(|c| c.audio.sample_rate = 8000).await;
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(store.get().audio.sample_rate, 48000);
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[session\nname=").await.unwrap();
        assert!(matches!(
            ConfigStore::load(&path).await,
            Err(AppError::Config(_))
        ));
    }
}
