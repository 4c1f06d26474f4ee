//! Key-value persistence for workflow state.
//!
//! Every workflow owns a namespace (derived from its relative path) holding two
//! well-known keys, [`STATE_KEY`] and [`INTERNAL_STATE_KEY`]. The backend is
//! picked from an optional connection descriptor:
//!
//! - none: one JSON file per namespace under the data directory
//! - `json://<dir>`: one JSON file per namespace under `<dir>`
//! - `sqlite://<path>` / `sqlite::memory:`: a shared SQLite table

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::path_processing::expand_tilde;
use crate::sqlite_store::SqliteStore;

/// Key holding the user-visible workflow state.
pub const STATE_KEY: &str = "state";
/// Key holding the engine-owned dedup history.
pub const INTERNAL_STATE_KEY: &str = "internalState";
/// Default directory (relative to the invocation root) for JSON state files.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Errors surfaced by storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure while reading or writing a state file.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// SQLite failure.
    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The connection descriptor names no known backend.
    #[error("unsupported database descriptor '{0}'; expected json://<dir>, sqlite://<path> or sqlite::memory:")]
    UnsupportedDescriptor(String),
    /// A previous panic left the store lock poisoned.
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Minimal storage interface consumed by the engine. A store is bound to one namespace.
pub trait KeyValueStore: Send + Sync {
    /// Returns the stored value, or `None` when the key was never written.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Opens stores for workflow namespaces.
pub trait StoreProvider: Send + Sync {
    /// Opens the store for `namespace`, honouring an explicit connection descriptor.
    fn open(&self, namespace: &str, descriptor: Option<&str>) -> Result<Box<dyn KeyValueStore>, StoreError>;
}

/// Parsed connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreDescriptor {
    /// JSON files rooted at the given directory.
    JsonDirectory(PathBuf),
    /// SQLite database file.
    Sqlite(PathBuf),
    /// Transient SQLite database living as long as the opened store.
    SqliteMemory,
}

impl StoreDescriptor {
    /// Parses `raw`, resolving relative paths against `base`.
    pub fn parse(raw: &str, base: &Path) -> Result<Self, StoreError> {
        let trimmed = raw.trim();
        if trimmed == "sqlite::memory:" || trimmed == "sqlite://:memory:" {
            return Ok(Self::SqliteMemory);
        }
        if let Some(path) = trimmed.strip_prefix("sqlite://") {
            return Ok(Self::Sqlite(resolve_against(base, path)));
        }
        if let Some(path) = trimmed.strip_prefix("json://") {
            return Ok(Self::JsonDirectory(resolve_against(base, path)));
        }
        Err(StoreError::UnsupportedDescriptor(trimmed.to_string()))
    }
}

fn resolve_against(base: &Path, raw_path: &str) -> PathBuf {
    let expanded = expand_tilde(raw_path);
    if expanded.is_absolute() { expanded } else { base.join(expanded) }
}

/// Store provider implementing the descriptor rules described in the module docs.
#[derive(Debug, Clone)]
pub struct DefaultStoreProvider {
    root: PathBuf,
    data_dir: PathBuf,
}

impl DefaultStoreProvider {
    /// `root` resolves relative descriptors; `data_dir` holds JSON files when no descriptor is given.
    pub fn new(root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_dir = data_dir.into();
        let data_dir = if data_dir.is_absolute() { data_dir } else { root.join(data_dir) };
        Self { root, data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl StoreProvider for DefaultStoreProvider {
    fn open(&self, namespace: &str, descriptor: Option<&str>) -> Result<Box<dyn KeyValueStore>, StoreError> {
        let descriptor = match descriptor {
            Some(raw) if !raw.trim().is_empty() => StoreDescriptor::parse(raw, &self.root)?,
            _ => StoreDescriptor::JsonDirectory(self.data_dir.clone()),
        };
        debug!(namespace = %namespace, ?descriptor, "opening state store");
        match descriptor {
            StoreDescriptor::JsonDirectory(directory) => Ok(Box::new(JsonFileStore::open(&directory, namespace)?)),
            StoreDescriptor::Sqlite(path) => Ok(Box::new(SqliteStore::open(&path, namespace)?)),
            StoreDescriptor::SqliteMemory => Ok(Box::new(SqliteStore::open_in_memory(namespace)?)),
        }
    }
}

/// Stored value metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct StoredValue {
    value: Value,
    #[serde(with = "ts_seconds", rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

#[derive(Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    entries: BTreeMap<String, StoredValue>,
}

/// JSON-backed store: one file per namespace.
pub struct JsonFileStore {
    path: PathBuf,
    file: Mutex<StateFile>,
}

impl JsonFileStore {
    /// Opens (without creating) `<directory>/<namespace>.json`.
    pub fn open(directory: &Path, namespace: &str) -> Result<Self, StoreError> {
        let path = directory.join(format!("{namespace}.json"));
        let file = load_state_file(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_locked(&self, state_file: &StateFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state_file)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let file = self.file.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(file.entries.get(key).map(|stored| stored.value.clone()))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut file = self.file.lock().map_err(|_| StoreError::Poisoned)?;
        file.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                updated_at: Utc::now(),
            },
        );
        self.save_locked(&file)
    }
}

fn load_state_file(path: &Path) -> Result<StateFile, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<StateFile>(&content) {
            Ok(file) => Ok(file),
            Err(error) => {
                warn!("Failed to parse state file at {}: {}", path.display(), error);
                Ok(StateFile::default())
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
        Err(error) => Err(StoreError::Io(error)),
    }
}

type SharedEntries = Arc<Mutex<HashMap<String, Value>>>;

/// In-memory store primarily used for testing.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: SharedEntries,
    writes: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls observed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider handing out one shared [`InMemoryStore`] per namespace.
///
/// Descriptors are ignored, so repeated runs observe each other's writes.
#[derive(Clone, Default)]
pub struct InMemoryStoreProvider {
    stores: Arc<Mutex<HashMap<String, InMemoryStore>>>,
}

impl InMemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store of `namespace`, creating it when missing.
    pub fn store(&self, namespace: &str) -> Result<InMemoryStore, StoreError> {
        let mut stores = self.stores.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(stores.entry(namespace.to_string()).or_default().clone())
    }

    /// Total writes across every namespace.
    pub fn total_writes(&self) -> usize {
        self.stores
            .lock()
            .map(|stores| stores.values().map(InMemoryStore::write_count).sum())
            .unwrap_or_default()
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn open(&self, namespace: &str, _descriptor: Option<&str>) -> Result<Box<dyn KeyValueStore>, StoreError> {
        Ok(Box::new(self.store(namespace)?))
    }
}
