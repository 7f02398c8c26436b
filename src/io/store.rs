//! Local key-value state store
//!
//! Shared between the background session and foreground readers. Values are
//! strings (JSON for structured entries). There is no cross-process locking:
//! readers must tolerate slightly stale values and re-read rather than expect
//! push notifications.

use crate::domain::types::UserRole;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Key names shared by the session, the retry queue and foreground readers
pub mod keys {
    /// Cached safe-zone definition
    pub const SAFE_ZONE: &str = "safe_zone";
    /// Position and timestamp of the last sent continuous sample
    pub const LAST_SENT: &str = "last_sent";
    /// Caregiver-controlled safe-exit override flag
    pub const SAFE_EXIT: &str = "safe_exit";
    /// Account type of the signed-in user (`Patient` / `Caregiver`)
    pub const USER_TYPE: &str = "user_type";
    /// Pending submissions awaiting retry
    pub const LOCATION_QUEUE: &str = "location_queue";
    /// Most recent continuous sample, for map rendering
    pub const LAST_KNOWN_POSITION: &str = "last_known_position";
    /// Zone state, debounce timestamp and scheduler state
    pub const SESSION_STATE: &str = "session_state";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error for key {key}: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read and decode a JSON value
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Serde { key: key.to_string(), source }),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|source| StoreError::Serde { key: key.to_string(), source })?;
    store.set(key, raw).await
}

/// Role of the signed-in user; `None` when unset or unrecognised
pub async fn load_role(store: &dyn StateStore) -> Result<Option<UserRole>, StoreError> {
    Ok(store.get(keys::USER_TYPE).await?.as_deref().and_then(UserRole::parse))
}

/// Volatile store for tests and short-lived hosts
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk
///
/// Every write rewrites the file through a temporary sibling and a rename, so
/// a crash mid-write leaves the previous snapshot intact. File I/O runs on the
/// blocking pool; `flush_lock` keeps snapshots landing in the order they were
/// taken.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content).map_err(|source| StoreError::Serde {
                    key: path.display().to_string(),
                    source,
                })?
            }
        } else {
            HashMap::new()
        };

        info!(path = %path.display(), keys = %entries.len(), "file_store_opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn snapshot(&self, entries: &HashMap<String, String>) -> Result<String, StoreError> {
        serde_json::to_string_pretty(entries).map_err(|source| StoreError::Serde {
            key: self.path.display().to_string(),
            source,
        })
    }

    /// Write a snapshot off the async runtime
    async fn flush(&self, json: String) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &json))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }
}

fn write_snapshot(path: &Path, json: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json.as_bytes())?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), bytes = %json.len(), "file_store_flushed");
    Ok(())
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let _flush = self.flush_lock.lock().await;
        let json = {
            let mut entries = self.entries.lock();
            entries.insert(key.to_string(), value);
            self.snapshot(&entries)?
        };
        self.flush(json).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _flush = self.flush_lock.lock().await;
        let json = {
            let mut entries = self.entries.lock();
            if entries.remove(key).is_none() {
                return Ok(());
            }
            self.snapshot(&entries)?
        };
        self.flush(json).await
    }
}
