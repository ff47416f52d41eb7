#![forbid(unsafe_code)]

// JSON document store — whole-document replace per key, no schema migration.
// Saves are best-effort: in-memory state stays the source of truth until the
// next successful write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// File-backed store for the small JSON documents the server owns
/// (admin accounts, ban list, role permissions).
#[derive(Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Load from environment variables. `DATA_DIR` defaults to `./data`.
    pub fn from_env() -> Self {
        let dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into());
        info!("Data directory: {}", dir);
        Self { dir: PathBuf::from(dir) }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read and parse a document, falling back to the default on a missing
    /// or malformed file. A malformed file is reported but never fatal.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let path = self.path_for(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                info!("No {} document at {}, using defaults", key, path.display());
                return T::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Malformed {} document at {}: {} — using defaults", key, path.display(), e);
                T::default()
            }
        }
    }

    /// Synchronous write, used at startup/shutdown when blocking is fine.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), json)?;
        Ok(())
    }

    /// Fire-and-forget write. Serialization happens on the caller's stack so
    /// the value needs no 'static bound; the disk write is offloaded and any
    /// failure is logged and swallowed.
    pub fn save_detached<T: Serialize>(&self, key: &str, value: &T) {
        let json = match serde_json::to_string_pretty(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize {} document: {}", key, e);
                return;
            }
        };
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!("Failed to create data directory {}: {}", dir.display(), e);
                return;
            }
            if let Err(e) = tokio::fs::write(&path, json).await {
                warn!("Failed to persist {} document to {}: {}", key, path.display(), e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scratch_store() -> Store {
        let dir = std::env::temp_dir().join(format!("openmic-test-{}", uuid::Uuid::new_v4()));
        Store::with_dir(dir)
    }

    #[test]
    fn test_missing_document_yields_default() {
        let store = scratch_store();
        let value: HashMap<String, Vec<String>> = store.load_or_default("absent");
        assert!(value.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let store = scratch_store();
        let mut doc = HashMap::new();
        doc.insert("mod".to_string(), vec!["mute".to_string()]);
        store.save("perm", &doc).unwrap();

        let loaded: HashMap<String, Vec<String>> = store.load_or_default("perm");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_malformed_document_yields_default() {
        let store = scratch_store();
        std::fs::create_dir_all(store.dir.clone()).unwrap();
        std::fs::write(store.path_for("broken"), "{not json").unwrap();

        let value: HashMap<String, Vec<String>> = store.load_or_default("broken");
        assert!(value.is_empty());
    }
}
