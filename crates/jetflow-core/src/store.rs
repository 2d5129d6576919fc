//! Shared key/value store boundary.
//!
//! Checkpoint cursors and distributed-lock slots live in a store shared
//! across processes. The store itself is an external collaborator; this
//! module defines the interface jetflow needs from it plus two local
//! implementations:
//!
//! | Store | Use case |
//! |-------|----------|
//! | [`MemoryStore`] | Testing, single-process deployments |
//! | [`FileStore`] | Single-node production (JSON files, atomic writes) |
//!
//! All writes are safe to race: checkpoint slots are last-write-wins
//! monotonic hints, and lock slots are guarded by the owner-id check in
//! [`del_if_eq`](SharedStore::del_if_eq).

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Interface to the shared key/value store.
///
/// `put_u64` callers may treat the write as fire-and-forget; implementations
/// must still surface errors so callers can choose to log them instead.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read an integer slot. Expired entries read as absent.
    async fn get_u64(&self, key: &str) -> Result<Option<u64>>;

    /// Overwrite an integer slot unconditionally, with no expiry.
    async fn put_u64(&self, key: &str, value: u64) -> Result<()>;

    /// Set the slot only if it is absent (or expired). Returns whether the
    /// write happened.
    async fn set_nx(&self, key: &str, value: u64, ttl: Duration) -> Result<bool>;

    /// Delete the slot only if it still holds `value`. Returns whether a
    /// deletion happened.
    async fn del_if_eq(&self, key: &str, value: u64) -> Result<bool>;
}

/// Shared store handle.
pub type SharedStoreRef = Arc<dyn SharedStore>;

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    value: u64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|t| Instant::now() < t)
    }
}

/// In-memory store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let entries = self.entries.read();
        Ok(entries.get(key).filter(|e| e.is_live()).map(|e| e.value))
    }

    async fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: u64, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| e.is_live()) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, value: u64) -> Result<bool> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(e) if e.is_live() && e.value == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// File-backed store
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    value: u64,
    /// Unix epoch millis; absent = no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at_ms.is_none_or(|t| unix_millis() < t)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// File-backed store: one JSON file per key under a base directory.
///
/// Plain writes go through a temp file + atomic rename. `set_nx` relies on
/// `O_EXCL` file creation, so the not-exists case is atomic even across
/// processes sharing the directory. `del_if_eq` is read-check-remove; a lost
/// race there is harmless because only the matching owner value is removed.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create the store, creating the directory if needed.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn file_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains('\\') {
            return Err(Error::Store(format!("invalid store key: {key:?}")));
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<StoredValue>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entry(&self, path: &Path, entry: &StoredValue) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec(entry)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SharedStore for FileStore {
    async fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let path = self.file_path(key)?;
        Ok(self
            .read_entry(&path)
            .await?
            .filter(StoredValue::is_live)
            .map(|e| e.value))
    }

    async fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        let path = self.file_path(key)?;
        self.write_entry(
            &path,
            &StoredValue {
                value,
                expires_at_ms: None,
            },
        )
        .await?;
        debug!(key, value, "stored value");
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: u64, ttl: Duration) -> Result<bool> {
        let path = self.file_path(key)?;

        if let Some(existing) = self.read_entry(&path).await? {
            if existing.is_live() {
                return Ok(false);
            }
            // Expired slot: clear it, then race for the exclusive create below.
            let _ = fs::remove_file(&path).await;
        }

        let entry = StoredValue {
            value,
            expires_at_ms: Some(unix_millis() + ttl.as_millis() as u64),
        };
        let json = serde_json::to_vec(&entry)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(&json).await?;
                file.sync_all().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn del_if_eq(&self, key: &str, value: u64) -> Result<bool> {
        let path = self.file_path(key)?;
        match self.read_entry(&path).await? {
            Some(e) if e.is_live() && e.value == value => {
                fs::remove_file(&path).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
