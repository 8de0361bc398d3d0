//! Persistence seam for runtime configuration changes.
//!
//! The host platform owns the persisted configuration. After an admin command
//! changes the limiter, the router hands the new snapshot to a `ConfigStore`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::PluginConfig;
use crate::error::{RateLimitError, Result};

/// Trait for configuration stores.
///
/// This trait abstracts over the file-backed store used by the console host
/// and whatever store an embedding host provides.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Persist the given configuration.
    async fn save(&self, config: &PluginConfig) -> Result<()>;
}

/// Writes the configuration to a YAML file, or JSON when the path ends in `.json`.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// Create a store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this store writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_json(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    }

    fn render(&self, config: &PluginConfig) -> Result<String> {
        if self.is_json() {
            serde_json::to_string_pretty(config).map_err(|e| RateLimitError::Config(e.to_string()))
        } else {
            config.to_yaml()
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn save(&self, config: &PluginConfig) -> Result<()> {
        let contents = self.render(config)?;
        tokio::fs::write(&self.path, contents).await?;
        info!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}

/// Keeps the most recent snapshot in memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    last: Mutex<Option<PluginConfig>>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently saved configuration.
    pub fn last_saved(&self) -> Option<PluginConfig> {
        self.last.lock().clone()
    }

    /// How many times `save` has been called.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn save(&self, config: &PluginConfig) -> Result<()> {
        *self.last.lock() = Some(config.clone());
        *self.saves.lock() += 1;
        debug!("Configuration snapshot kept in memory");
        Ok(())
    }
}
