//! Client-side key store.
//!
//! Persists the [`ApiKeys`] a client sends with each chat request. The file
//! holds one JSON object with the keys under `"api-keys"`; every mutation
//! is written through immediately.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::credentials::{ApiKeys, ProviderKind};

/// Key under which the record is stored.
pub const STORAGE_KEY: &str = "api-keys";

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Failed to write key store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode key store: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoreFile {
    #[serde(rename = "api-keys", default)]
    api_keys: ApiKeys,
}

/// File-backed [`ApiKeys`] with save-on-change.
#[derive(Debug)]
pub struct ApiKeyStore {
    path: PathBuf,
    keys: ApiKeys,
}

impl ApiKeyStore {
    /// Default store location: `$XDG_DATA_HOME/chatrelay/api-keys.json`,
    /// then `~/.local/share/chatrelay/api-keys.json`.
    pub fn default_path() -> PathBuf {
        if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg_data).join("chatrelay/api-keys.json");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share/chatrelay/api-keys.json");
        }
        PathBuf::from(".chatrelay/api-keys.json")
    }

    /// Load the store. A missing file is an empty store; an unreadable or
    /// malformed one is logged and treated as empty.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let keys = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StoreFile>(&content) {
                Ok(file) => file.api_keys,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed key store");
                    ApiKeys::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ApiKeys::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read key store");
                ApiKeys::default()
            }
        };
        Self { path, keys }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keys(&self) -> &ApiKeys {
        &self.keys
    }

    /// Store a key (or Ollama base URL). Blank values clear the entry.
    pub fn set(&mut self, kind: ProviderKind, value: &str) -> Result<(), KeyStoreError> {
        let value = value.trim();
        let value = (!value.is_empty()).then(|| value.to_string());
        self.update(kind, value)
    }

    pub fn clear(&mut self, kind: ProviderKind) -> Result<(), KeyStoreError> {
        self.update(kind, None)
    }

    fn update(&mut self, kind: ProviderKind, value: Option<String>) -> Result<(), KeyStoreError> {
        if self.keys.get(kind) == value.as_deref() {
            return Ok(());
        }
        self.keys.set(kind, value);
        self.save()
    }

    /// Write the store to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<(), KeyStoreError> {
        let io_err = |source| KeyStoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = StoreFile {
            api_keys: self.keys.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, content).map_err(io_err)?;

        tracing::debug!(path = %self.path.display(), "Saved key store");
        Ok(())
    }
}
