//! Shared fixtures for session tests.

#![allow(dead_code)]

use async_trait::async_trait;
use pointer_collab::{
    AuthIdentity, DurableStore, MemoryHub, MemoryStore, NoteKind, SessionBinder, SessionConfig,
    SessionHandle, StoreError, StoredDocument, SyncContext, TransportFactory,
};
use pointer_core::{DocumentIdentity, ReplicatedDocument, Snapshot};
use std::sync::Arc;
use tokio::time::Duration;

pub fn note(paragraphs: &[&str], collaborative: bool) -> StoredDocument {
    StoredDocument::new("Test note", NoteKind::File, collaborative, &Snapshot::from_paragraphs(paragraphs))
}

pub fn auth(id: &str, name: &str) -> AuthIdentity {
    AuthIdentity {
        id: id.to_string(),
        full_name: Some(name.to_string()),
        email: None,
        avatar: None,
    }
}

/// One editor host: its own store, workspace and binder.
pub struct Host {
    pub store: Arc<MemoryStore>,
    pub ctx: Arc<SyncContext>,
    pub binder: SessionBinder,
}

impl Host {
    pub fn new(transports: Arc<dyn TransportFactory>, auth: Option<&AuthIdentity>) -> Self {
        Self::with_config(SessionConfig::for_testing(), transports, auth)
    }

    pub fn with_config(
        config: SessionConfig,
        transports: Arc<dyn TransportFactory>,
        auth: Option<&AuthIdentity>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(SyncContext::new(config, store.clone(), transports, auth));
        let binder = SessionBinder::new(ctx.clone());
        Self { store, ctx, binder }
    }

    /// Host whose writes take `delay` to complete.
    pub fn with_slow_store(hub: &MemoryHub, delay: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let slow = Arc::new(SlowStore { inner: store.clone(), delay });
        let ctx = Arc::new(SyncContext::new(
            SessionConfig::for_testing(),
            slow,
            Arc::new(hub.clone()),
            Some(&auth("user_1", "Ada")),
        ));
        let binder = SessionBinder::new(ctx.clone());
        Self { store, ctx, binder }
    }

    pub fn on_hub(hub: &MemoryHub) -> Self {
        Self::new(Arc::new(hub.clone()), Some(&auth("user_1", "Ada")))
    }

    pub async fn open(&mut self, id: &str, stored: StoredDocument) -> SessionHandle {
        self.store.insert(id, stored);
        self.binder.bind(id).await.unwrap()
    }

    pub fn writes(&self, id: &str) -> usize {
        self.store.write_count(&DocumentIdentity::from(id))
    }

    pub fn is_unsaved(&self, id: &str) -> bool {
        self.ctx.workspace.is_unsaved(&DocumentIdentity::from(id))
    }
}

/// Memory store whose writes land only after a delay.
pub struct SlowStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl DurableStore for SlowStore {
    async fn read_document(&self, identity: &DocumentIdentity) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.read_document(identity).await
    }

    async fn write_document(&self, identity: &DocumentIdentity, document: &StoredDocument) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.write_document(identity, document).await
    }
}

pub async fn wait_editable(handle: &SessionHandle) {
    handle.wait_for(|s| s.editable).await.unwrap();
}

/// Let spawned tasks (driver, pumps, saves) run to idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Update produced by an outside peer that starts from the hub's state.
pub fn peer_edit(hub: &MemoryHub, id: &str, edit: impl FnOnce(&ReplicatedDocument)) -> Vec<u8> {
    let peer = ReplicatedDocument::new();
    if let Some(state) = hub.room_state(&DocumentIdentity::from(id)) {
        peer.apply_remote(&state).unwrap();
    }
    let before = peer.state_vector();
    edit(&peer);
    peer.encode_diff(&before).unwrap()
}
