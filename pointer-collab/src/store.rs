//! Durable store of record.
//!
//! The store is external to the sync core; sessions only read a note when
//! they bind and write it back when a save fires. Two adapters ship here:
//! an in-memory store with failure injection and a JSON-file store.

use async_trait::async_trait;
use parking_lot::Mutex;
use pointer_core::{DocumentIdentity, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    #[default]
    File,
    Folder,
}

/// Stored note body. `document` is untrusted until [`NoteContent::snapshot`]
/// validates its shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteContent {
    pub document: Option<Value>,
    #[serde(default)]
    pub text: String,
}

impl NoteContent {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            document: Some(snapshot.to_value()),
            text: snapshot.plain_text(),
        }
    }

    /// The stored tree, or an empty document when its shape is invalid.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::parse_or_empty(self.document.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub name: String,
    #[serde(default)]
    pub kind: NoteKind,
    /// Whether edits replicate to other sessions.
    #[serde(default)]
    pub collaborative: bool,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub content: NoteContent,
    pub metadata: NoteMetadata,
}

impl StoredDocument {
    pub fn new(name: impl Into<String>, kind: NoteKind, collaborative: bool, snapshot: &Snapshot) -> Self {
        Self {
            content: NoteContent::from_snapshot(snapshot),
            metadata: NoteMetadata {
                name: name.into(),
                kind,
                collaborative,
                updated_at: now_millis(),
            },
        }
    }

    pub fn is_file(&self) -> bool {
        self.metadata.kind == NoteKind::File
    }

    pub fn touch(&mut self) {
        self.metadata.updated_at = now_millis();
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read_document(&self, identity: &DocumentIdentity) -> Result<Option<StoredDocument>, StoreError>;

    async fn write_document(&self, identity: &DocumentIdentity, document: &StoredDocument) -> Result<(), StoreError>;
}

// ───────────────────────────────────────────────────────────────────
// MemoryStore
// ───────────────────────────────────────────────────────────────────

/// In-memory store recording every write.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentIdentity, StoredDocument>>,
    writes: Mutex<Vec<(DocumentIdentity, StoredDocument)>>,
    reads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: impl Into<DocumentIdentity>, document: StoredDocument) {
        self.documents.lock().insert(identity.into(), document);
    }

    pub fn get(&self, identity: &DocumentIdentity) -> Option<StoredDocument> {
        self.documents.lock().get(identity).cloned()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful writes, oldest first.
    pub fn writes(&self) -> Vec<(DocumentIdentity, StoredDocument)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self, identity: &DocumentIdentity) -> usize {
        self.writes.lock().iter().filter(|(id, _)| id == identity).count()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read_document(&self, identity: &DocumentIdentity) -> Result<Option<StoredDocument>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(identity))
    }

    async fn write_document(&self, identity: &DocumentIdentity, document: &StoredDocument) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("store unavailable".to_string()));
        }
        self.documents.lock().insert(identity.clone(), document.clone());
        self.writes.lock().push((identity.clone(), document.clone()));
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// FileStore
// ───────────────────────────────────────────────────────────────────

/// One pretty-printed JSON file per note under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name for `identity`: `[A-Za-z0-9_-]` kept, every other byte
    /// written as `%XX`, so distinct identities never share a file.
    fn path_for(&self, identity: &DocumentIdentity) -> PathBuf {
        let mut file = String::with_capacity(identity.as_str().len());
        for byte in identity.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                file.push(char::from(byte));
            } else {
                file.push_str(&format!("%{byte:02X}"));
            }
        }
        self.root.join(format!("{file}.json"))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read_document(&self, identity: &DocumentIdentity) -> Result<Option<StoredDocument>, StoreError> {
        let path = self.path_for(identity);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_document(&self, identity: &DocumentIdentity, document: &StoredDocument) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(identity);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("Wrote {} to {}", identity, path.display());
        Ok(())
    }
}
