//! Editing-surface facade over the shared document.
//!
//! The host's rich-text surface mutates the replicated document through
//! [`EditorHandle`]. Mutations are refused unless the session is editable
//! (connected, or running without replication).

use parking_lot::{Mutex, RwLock};
use pointer_core::{CollabError, Node, ReplicatedDocument, Snapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("editor is read-only")]
    ReadOnly,
    #[error("session closed")]
    Closed,
    #[error(transparent)]
    Content(#[from] CollabError),
}

/// Signals from the editing surface to the session driver.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EditorSignal {
    ContentError(String),
}

/// State shared by every clone of an [`EditorHandle`] and the driver.
pub(crate) struct EditorState {
    document: RwLock<Arc<ReplicatedDocument>>,
    editable: AtomicBool,
    closed: AtomicBool,
    command_menu: Mutex<Option<String>>,
}

impl EditorState {
    pub(crate) fn new(document: Arc<ReplicatedDocument>) -> Self {
        Self {
            document: RwLock::new(document),
            editable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            command_menu: Mutex::new(None),
        }
    }

    pub(crate) fn document(&self) -> Arc<ReplicatedDocument> {
        self.document.read().clone()
    }

    /// Point every handle at `document`, e.g. after a corrupted merge.
    pub(crate) fn replace_document(&self, document: Arc<ReplicatedDocument>) {
        *self.document.write() = document;
    }

    pub(crate) fn set_editable(&self, editable: bool) {
        self.editable.store(editable, Ordering::SeqCst);
        if !editable {
            if let Some(query) = self.command_menu.lock().take() {
                log::debug!("Closing command menu ({query:?}) on read-only transition");
            }
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_editable(false);
    }
}

#[derive(Clone)]
pub struct EditorHandle {
    state: Arc<EditorState>,
    signals: mpsc::UnboundedSender<EditorSignal>,
}

impl EditorHandle {
    pub(crate) fn new(state: Arc<EditorState>, signals: mpsc::UnboundedSender<EditorSignal>) -> Self {
        Self { state, signals }
    }

    pub fn is_editable(&self) -> bool {
        !self.is_closed() && self.state.editable.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn writable(&self) -> Result<Arc<ReplicatedDocument>, EditorError> {
        if self.is_closed() {
            return Err(EditorError::Closed);
        }
        if !self.state.editable.load(Ordering::SeqCst) {
            return Err(EditorError::ReadOnly);
        }
        Ok(self.state.document())
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Result<Snapshot, EditorError> {
        Ok(self.state.document().snapshot()?)
    }

    pub fn plain_text(&self) -> Result<String, EditorError> {
        Ok(self.state.document().plain_text()?)
    }

    // ── Mutations ────────────────────────────────────────────────

    pub fn set_snapshot(&self, snapshot: &Snapshot) -> Result<(), EditorError> {
        Ok(self.writable()?.replace_content(snapshot)?)
    }

    pub fn insert_block(&self, index: u32, block: &Node) -> Result<(), EditorError> {
        Ok(self.writable()?.insert_block(index, block)?)
    }

    pub fn append_paragraph(&self, text: &str) -> Result<(), EditorError> {
        Ok(self.writable()?.append_block(&Node::paragraph(text))?)
    }

    pub fn insert_text(&self, block: u32, offset: u32, text: &str) -> Result<(), EditorError> {
        Ok(self.writable()?.insert_text(block, offset, text)?)
    }

    pub fn remove_blocks(&self, index: u32, count: u32) -> Result<(), EditorError> {
        Ok(self.writable()?.remove_blocks(index, count)?)
    }

    /// Undo through the replication layer's history.
    pub fn undo(&self) -> Result<bool, EditorError> {
        Ok(self.writable()?.undo())
    }

    pub fn redo(&self) -> Result<bool, EditorError> {
        Ok(self.writable()?.redo())
    }

    // ── Slash-command menu ───────────────────────────────────────

    pub fn open_command_menu(&self, query: impl Into<String>) -> Result<(), EditorError> {
        self.writable()?;
        *self.state.command_menu.lock() = Some(query.into());
        Ok(())
    }

    pub fn command_menu(&self) -> Option<String> {
        self.state.command_menu.lock().clone()
    }

    pub fn close_command_menu(&self) {
        self.state.command_menu.lock().take();
    }

    /// The surface found a tree it cannot render; the session stops
    /// replicating instead of failing.
    pub fn report_validation_error(&self, message: impl Into<String>) {
        let _ = self.signals.send(EditorSignal::ContentError(message.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> (EditorHandle, Arc<EditorState>, mpsc::UnboundedReceiver<EditorSignal>) {
        let state = Arc::new(EditorState::new(Arc::new(ReplicatedDocument::new())));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EditorHandle::new(state.clone(), tx);
        (handle, state, rx)
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let (editor, _state, _rx) = editor();
        assert!(!editor.is_editable());
        assert!(matches!(editor.append_paragraph("x"), Err(EditorError::ReadOnly)));
        assert!(matches!(editor.insert_text(0, 0, "x"), Err(EditorError::ReadOnly)));
        assert!(matches!(editor.set_snapshot(&Snapshot::empty()), Err(EditorError::ReadOnly)));
        assert!(matches!(editor.undo(), Err(EditorError::ReadOnly)));
        assert_eq!(editor.plain_text().unwrap(), "");
    }

    #[test]
    fn test_editable_mutations_apply() {
        let (editor, state, _rx) = editor();
        state.set_editable(true);
        editor.append_paragraph("Hllo").unwrap();
        editor.insert_text(0, 1, "e").unwrap();
        assert_eq!(editor.plain_text().unwrap(), "Hello");
        assert!(editor.undo().unwrap());
    }

    #[test]
    fn test_read_only_transition_closes_command_menu() {
        let (editor, state, _rx) = editor();
        state.set_editable(true);
        editor.open_command_menu("/head").unwrap();
        assert_eq!(editor.command_menu().as_deref(), Some("/head"));

        state.set_editable(false);
        assert!(editor.command_menu().is_none());
        assert!(matches!(editor.open_command_menu("/"), Err(EditorError::ReadOnly)));
    }

    #[test]
    fn test_closed_editor() {
        let (editor, state, _rx) = editor();
        state.set_editable(true);
        state.close();
        assert!(editor.is_closed());
        assert!(matches!(editor.append_paragraph("x"), Err(EditorError::Closed)));
    }

    #[test]
    fn test_replaced_document_reaches_existing_handles() {
        let (editor, state, _rx) = editor();
        state.set_editable(true);
        editor.append_paragraph("old").unwrap();
        let copy = editor.clone();

        let fresh = Arc::new(ReplicatedDocument::new());
        fresh.seed(&Snapshot::from_paragraphs(&["kept"])).unwrap();
        state.replace_document(fresh.clone());

        copy.append_paragraph("new").unwrap();
        assert_eq!(editor.plain_text().unwrap(), "kept\n\nnew");
        assert_eq!(fresh.plain_text().unwrap(), "kept\n\nnew");
    }

    #[test]
    fn test_validation_error_reaches_driver() {
        let (editor, _state, mut rx) = editor();
        editor.report_validation_error("unknown node type");
        assert_eq!(rx.try_recv().unwrap(), EditorSignal::ContentError("unknown node type".to_string()));
    }
}
