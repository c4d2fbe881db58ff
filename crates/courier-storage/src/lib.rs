use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io")]
    Io,
    #[error("codec")]
    Codec,
    #[error("unavailable")]
    Unavailable,
}

/// Opaque key-value rows keyed by namespaced string keys. Reads and writes
/// are modeled as suspension points so file or remote backends fit behind
/// the same seam as the in-memory one.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Rows whose key starts with `prefix`, in ascending key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_available()?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.check_available()?;
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        self.check_available()?;
        let guard = self.entries.lock().await;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StoredRows {
    entries: BTreeMap<String, Vec<u8>>,
}

/// Single-file JSON store, one file per namespace.
pub struct FileStore {
    path: PathBuf,
    rows: Mutex<StoredRows>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>, namespace: &str) -> Result<Self, StorageError> {
        let mut base = path.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|_| StorageError::Io)?;
        base.push(format!("{}-store.json", namespace));
        let rows = if base.exists() {
            let content = fs::read_to_string(&base).map_err(|_| StorageError::Io)?;
            serde_json::from_str(&content).map_err(|_| StorageError::Codec)?
        } else {
            StoredRows::default()
        };
        Ok(Self {
            path: base,
            rows: Mutex::new(rows),
        })
    }

    fn persist(&self, rows: &StoredRows) -> Result<(), StorageError> {
        let serialized = serde_json::to_string_pretty(rows).map_err(|_| StorageError::Codec)?;
        fs::write(&self.path, serialized).map_err(|_| StorageError::Io)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.rows.lock().await.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut guard = self.rows.lock().await;
        guard.entries.insert(key.to_string(), value);
        self.persist(&guard)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.rows.lock().await;
        if guard.entries.remove(key).is_some() {
            self.persist(&guard)?;
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let guard = self.rows.lock().await;
        Ok(guard
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip_and_scan() {
        let store = MemoryStore::new();
        store.put("group:2", b"b".to_vec()).await.expect("put");
        store.put("group:1", b"a".to_vec()).await.expect("put");
        store.put("other:9", b"c".to_vec()).await.expect("put");
        assert_eq!(store.get("group:1").await.expect("get"), Some(b"a".to_vec()));
        let rows = store.scan_prefix("group:").await.expect("scan");
        let keys: Vec<&str> = rows.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["group:1", "group:2"]);
        store.delete("group:1").await.expect("delete");
        assert_eq!(store.get("group:1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn memory_store_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("any").await,
            Err(StorageError::Unavailable)
        ));
        store.set_unavailable(false);
        assert_eq!(store.get("any").await.expect("get"), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FileStore::open(dir.path(), "test").expect("open");
            store.put("counter", b"41".to_vec()).await.expect("put");
        }
        let store = FileStore::open(dir.path(), "test").expect("reopen");
        assert_eq!(store.get("counter").await.expect("get"), Some(b"41".to_vec()));
        let rows = store.scan_prefix("count").await.expect("scan");
        assert_eq!(rows.len(), 1);
    }
}
