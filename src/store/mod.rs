use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Durable store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("corrupt state document: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Document keys used by the engine
pub mod keys {
    pub const SCHEDULES: &str = "schedules";
    pub const KNOWN_DEVICES: &str = "known_devices";
    pub const BLOCKED_DEVICES: &str = "blocked_devices";
    pub const AUDIT: &str = "audit";
}

/// Opaque durable key-value store of JSON documents.
///
/// The engine never cares how documents are kept, only that a saved
/// document comes back on the next load.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self, key: &str) -> StoreResult<Option<Value>>;
    async fn save(&self, key: &str, value: Value) -> StoreResult<()>;
}

/// Store backed by a single JSON document file on disk.
///
/// The whole document map is held in memory and rewritten on every save,
/// going through a temp file and rename so a crash mid-write never leaves
/// a truncated state file behind.
pub struct JsonFileStore {
    path: PathBuf,
    documents: Mutex<HashMap<String, Value>>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let documents = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            documents: Mutex::new(documents),
        })
    }

    async fn flush(&self, documents: &HashMap<String, Value>) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(documents)?;
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn load(&self, key: &str) -> StoreResult<Option<Value>> {
        let documents = self.documents.lock().await;
        Ok(documents.get(key).cloned())
    }

    async fn save(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut documents = self.documents.lock().await;
        documents.insert(key.to_string(), value);
        self.flush(&documents).await
    }
}

/// In-memory store, used by tests and available as a no-persistence mode.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, key: &str) -> StoreResult<Option<Value>> {
        let documents = self.documents.lock().await;
        Ok(documents.get(key).cloned())
    }

    async fn save(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut documents = self.documents.lock().await;
        documents.insert(key.to_string(), value);
        Ok(())
    }
}
