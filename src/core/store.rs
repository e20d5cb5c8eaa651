//! Key-value persistence collaborator.
//!
//! The host supplies the real store; [`MemoryStore`] and [`FileStore`] cover
//! tests, single-process deployments and the CLI.

use async_trait::async_trait;
use base64::Engine as _;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};

use crate::core::error::{McpError, McpResult};

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> McpResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> McpResult<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> McpResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> McpResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> McpResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> McpResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// A single JSON document of base64 values, rewritten atomically on every
/// mutation. Suitable for a CLI, not for heavy write traffic. File I/O runs on
/// the blocking pool.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn with_entries<T, F>(&self, op: F) -> McpResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, BTreeMap<String, String>) -> McpResult<T> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let entries = read_entries(&path)?;
            op(&path, entries)
        })
        .await
        .map_err(|err| McpError::storage(format!("store task failed: {err}")))?
    }
}

fn read_entries(path: &Path) -> McpResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents = fs::read_to_string(path)
        .map_err(|err| McpError::storage(format!("failed to read {}: {err}", path.display())))?;
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&contents)
        .map_err(|err| McpError::storage(format!("failed to parse {}: {err}", path.display())))
}

fn write_entries(path: &Path, entries: &BTreeMap<String, String>) -> McpResult<()> {
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).map_err(|err| McpError::storage(err.to_string()))?;
    }

    let contents =
        serde_json::to_string_pretty(entries).map_err(|err| McpError::storage(err.to_string()))?;
    let mut temp_file = match parent {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(|err| McpError::storage(err.to_string()))?;

    temp_file
        .write_all(contents.as_bytes())
        .and_then(|_| temp_file.as_file_mut().sync_all())
        .map_err(|err| McpError::storage(err.to_string()))?;
    temp_file
        .persist(path)
        .map_err(|err| McpError::storage(err.to_string()))?;
    Ok(())
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> McpResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_entries(move |_, entries| {
            entries
                .get(&key)
                .map(|encoded| {
                    base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|err| McpError::storage(format!("corrupt value for {key}: {err}")))
                })
                .transpose()
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> McpResult<()> {
        let key = key.to_string();
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        self.with_entries(move |path, mut entries| {
            entries.insert(key, encoded);
            write_entries(path, &entries)
        })
        .await
    }

    async fn delete(&self, key: &str) -> McpResult<()> {
        let key = key.to_string();
        self.with_entries(move |path, mut entries| {
            if entries.remove(&key).is_some() {
                write_entries(path, &entries)?;
            }
            Ok(())
        })
        .await
    }
}
