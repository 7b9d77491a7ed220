use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::ConversationDocument;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid chat id: {0:?}")]
    InvalidKey(String),

    #[error("chat not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Whole-document persistence keyed by chat id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, chat_id: &str) -> StoreResult<Option<ConversationDocument>>;
    async fn save(&self, chat_id: &str, document: &ConversationDocument) -> StoreResult<()>;
    async fn delete(&self, chat_id: &str) -> StoreResult<bool>;
    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// Keeps only `[A-Za-z0-9_-]`.
pub fn sanitize_chat_id(chat_id: &str) -> StoreResult<String> {
    let safe: String = chat_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        return Err(StoreError::InvalidKey(chat_id.to_string()));
    }
    Ok(safe)
}

/// One `<chat_id>.json` file per conversation under `base_path`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    base_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub async fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn document_path(&self, chat_id: &str) -> StoreResult<PathBuf> {
        let safe = sanitize_chat_id(chat_id)?;
        Ok(self.base_path.join(format!("{}.json", safe)))
    }

    /// Moves an unreadable document aside so the next save starts clean.
    async fn quarantine(&self, path: &Path) {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let mut target = path.as_os_str().to_owned();
        target.push(format!(".corrupted.{}", stamp));
        let target = PathBuf::from(target);
        match fs::rename(path, &target).await {
            Ok(()) => log::warn!(
                "Renamed corrupted document to {}",
                target.file_name().unwrap_or_default().to_string_lossy()
            ),
            Err(e) => log::error!("Failed to rename corrupted document {:?}: {}", path, e),
        }
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self, chat_id: &str) -> StoreResult<Option<ConversationDocument>> {
        let path = self.document_path(chat_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let parsed = serde_json::from_str(&content).and_then(ConversationDocument::from_value);
        match parsed {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                log::error!("Failed to parse document {:?}: {}", path, e);
                self.quarantine(&path).await;
                Ok(None)
            }
        }
    }

    async fn save(&self, chat_id: &str, document: &ConversationDocument) -> StoreResult<()> {
        let path = self.document_path(chat_id)?;
        fs::create_dir_all(&self.base_path).await?;

        let json = serde_json::to_string_pretty(document)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> StoreResult<bool> {
        let path = self.document_path(chat_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Volatile store, used by tests and embedders without a vault.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    documents: DashMap<String, ConversationDocument>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn load(&self, chat_id: &str) -> StoreResult<Option<ConversationDocument>> {
        let key = sanitize_chat_id(chat_id)?;
        Ok(self.documents.get(&key).map(|doc| doc.clone()))
    }

    async fn save(&self, chat_id: &str, document: &ConversationDocument) -> StoreResult<()> {
        let key = sanitize_chat_id(chat_id)?;
        self.documents.insert(key, document.clone());
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> StoreResult<bool> {
        let key = sanitize_chat_id(chat_id)?;
        Ok(self.documents.remove(&key).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Held for the duration of one read-modify-write of a document.
pub type DocumentGuard = OwnedMutexGuard<()>;

/// Document store plus a per-chat async mutex.
///
/// Every mutation goes through [`ConversationStore::update`] (or holds the
/// guard from [`ConversationStore::lock`]) so concurrent commands on the same
/// chat serialize instead of overwriting each other.
#[derive(Clone)]
pub struct ConversationStore {
    backend: Arc<dyn DocumentStore>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn backend(&self) -> Arc<dyn DocumentStore> {
        self.backend.clone()
    }

    pub async fn lock(&self, chat_id: &str) -> StoreResult<DocumentGuard> {
        let key = sanitize_chat_id(chat_id)?;
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Ok(mutex.lock_owned().await)
    }

    pub async fn load(&self, chat_id: &str) -> StoreResult<Option<ConversationDocument>> {
        self.backend.load(chat_id).await
    }

    pub async fn load_or_default(&self, chat_id: &str) -> StoreResult<ConversationDocument> {
        Ok(self.backend.load(chat_id).await?.unwrap_or_default())
    }

    /// Writes without taking the document lock; callers hold a guard.
    pub async fn save(&self, chat_id: &str, document: &ConversationDocument) -> StoreResult<()> {
        self.backend.save(chat_id, document).await
    }

    pub async fn delete(&self, chat_id: &str) -> StoreResult<bool> {
        let _guard = self.lock(chat_id).await?;
        self.backend.delete(chat_id).await
    }

    pub async fn list(&self) -> StoreResult<Vec<String>> {
        self.backend.list().await
    }

    /// Mutates an existing document under its lock.
    ///
    /// The document is written back only when `apply` returns `Ok`; an error
    /// leaves the stored copy untouched.
    pub async fn update<T, E, F>(&self, chat_id: &str, apply: F) -> Result<T, E>
    where
        F: FnOnce(&mut ConversationDocument) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _guard = self.lock(chat_id).await?;
        let mut document = self
            .backend
            .load(chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        let value = apply(&mut document)?;
        self.backend.save(chat_id, &document).await?;
        Ok(value)
    }

    /// Like [`ConversationStore::update`], starting from an empty document when
    /// none is stored yet.
    pub async fn update_or_create<T, E, F>(&self, chat_id: &str, apply: F) -> Result<T, E>
    where
        F: FnOnce(&mut ConversationDocument) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _guard = self.lock(chat_id).await?;
        let mut document = self.backend.load(chat_id).await?.unwrap_or_default();
        let value = apply(&mut document)?;
        self.backend.save(chat_id, &document).await?;
        Ok(value)
    }
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("locked_documents", &self.locks.len())
            .finish()
    }
}
