//! Process-wide note state shared by every session: open notes, the note
//! currently in the editor, unsaved markers and last content hashes.
//!
//! Unsaved markers follow local edits only. Each significant local edit
//! bumps a per-note revision; a save clears the marker only if no local
//! edit landed after its snapshot was taken. Remote changes move the content
//! hash but never the revision.
//!
//! Everything is keyed by [`DocumentIdentity`] and purged by
//! [`Workspace::close_session`].

use parking_lot::RwLock;
use pointer_core::{ContentHash, DocumentIdentity, Snapshot};
use std::collections::{BTreeSet, HashMap};

use crate::store::{NoteContent, StoredDocument};

#[derive(Default)]
struct WorkspaceState {
    notes: HashMap<DocumentIdentity, StoredDocument>,
    current: Option<DocumentIdentity>,
    unsaved: BTreeSet<DocumentIdentity>,
    hashes: HashMap<DocumentIdentity, ContentHash>,
    revisions: HashMap<DocumentIdentity, u64>,
}

#[derive(Default)]
pub struct Workspace {
    state: RwLock<WorkspaceState>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_note(&self, identity: DocumentIdentity, note: StoredDocument) {
        self.state.write().notes.insert(identity, note);
    }

    pub fn note(&self, identity: &DocumentIdentity) -> Option<StoredDocument> {
        self.state.read().notes.get(identity).cloned()
    }

    pub fn set_current(&self, identity: Option<DocumentIdentity>) {
        self.state.write().current = identity;
    }

    pub fn current(&self) -> Option<DocumentIdentity> {
        self.state.read().current.clone()
    }

    /// Replace a note's in-memory content. Returns `false` if it is not open.
    pub fn update_content(&self, identity: &DocumentIdentity, snapshot: &Snapshot) -> bool {
        let mut state = self.state.write();
        let Some(note) = state.notes.get_mut(identity) else {
            return false;
        };
        note.content = NoteContent::from_snapshot(snapshot);
        note.touch();
        state.hashes.insert(identity.clone(), snapshot.content_hash());
        true
    }

    pub fn content_hash(&self, identity: &DocumentIdentity) -> Option<ContentHash> {
        self.state.read().hashes.get(identity).copied()
    }

    /// Record a significant local edit. Returns the note's new revision.
    pub fn mark_unsaved(&self, identity: &DocumentIdentity) -> u64 {
        let mut state = self.state.write();
        state.unsaved.insert(identity.clone());
        let revision = state.revisions.entry(identity.clone()).or_insert(0);
        *revision += 1;
        *revision
    }

    /// Revision of the last significant local edit, `0` if none.
    pub fn local_revision(&self, identity: &DocumentIdentity) -> u64 {
        self.state.read().revisions.get(identity).copied().unwrap_or(0)
    }

    pub fn is_unsaved(&self, identity: &DocumentIdentity) -> bool {
        self.state.read().unsaved.contains(identity)
    }

    pub fn unsaved(&self) -> Vec<DocumentIdentity> {
        self.state.read().unsaved.iter().cloned().collect()
    }

    /// Clear the unsaved marker for a save taken at local revision `saved`.
    ///
    /// A local edit that landed while the save was in flight keeps the marker.
    pub fn mark_saved(&self, identity: &DocumentIdentity, saved: u64) -> bool {
        let mut state = self.state.write();
        let latest = state.revisions.get(identity).copied().unwrap_or(0);
        if latest != saved {
            return false;
        }
        state.unsaved.remove(identity)
    }

    /// Drop the unsaved marker without saving.
    pub fn discard(&self, identity: &DocumentIdentity) -> bool {
        self.state.write().unsaved.remove(identity)
    }

    /// Forget everything about `identity`.
    pub fn close_session(&self, identity: &DocumentIdentity) {
        let mut state = self.state.write();
        if state.unsaved.remove(identity) {
            log::warn!("Closing {identity} with unsaved changes");
        }
        state.notes.remove(identity);
        state.hashes.remove(identity);
        state.revisions.remove(identity);
        if state.current.as_ref() == Some(identity) {
            state.current = None;
        }
    }

    pub fn open_count(&self) -> usize {
        self.state.read().notes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NoteKind;

    fn workspace_with(id: &str) -> (Workspace, DocumentIdentity) {
        let ws = Workspace::new();
        let identity = DocumentIdentity::from(id);
        ws.open_note(identity.clone(), StoredDocument::new(id, NoteKind::File, true, &Snapshot::empty()));
        (ws, identity)
    }

    #[test]
    fn test_update_content_tracks_hash() {
        let (ws, id) = workspace_with("n1");
        let snap = Snapshot::from_paragraphs(&["hello"]);
        assert!(ws.update_content(&id, &snap));
        assert_eq!(ws.content_hash(&id), Some(snap.content_hash()));
        assert_eq!(ws.note(&id).unwrap().content.text, "hello");

        assert!(!ws.update_content(&DocumentIdentity::from("closed"), &snap));
    }

    #[test]
    fn test_mark_saved_only_for_latest_local_edit() {
        let (ws, id) = workspace_with("n1");
        ws.update_content(&id, &Snapshot::from_paragraphs(&["one"]));
        let first = ws.mark_unsaved(&id);
        ws.update_content(&id, &Snapshot::from_paragraphs(&["one two"]));
        let second = ws.mark_unsaved(&id);
        assert_eq!(ws.local_revision(&id), second);

        assert!(!ws.mark_saved(&id, first));
        assert!(ws.is_unsaved(&id));
        assert!(ws.mark_saved(&id, second));
        assert!(!ws.is_unsaved(&id));
    }

    #[test]
    fn test_remote_content_change_does_not_block_save() {
        let (ws, id) = workspace_with("n1");
        ws.update_content(&id, &Snapshot::from_paragraphs(&["mine"]));
        let saving = ws.mark_unsaved(&id);

        // A peer's edit arrives while the save is being written.
        ws.update_content(&id, &Snapshot::from_paragraphs(&["mine", "theirs"]));

        assert!(ws.mark_saved(&id, saving));
        assert!(!ws.is_unsaved(&id));
    }

    #[test]
    fn test_discard() {
        let (ws, id) = workspace_with("n1");
        ws.mark_unsaved(&id);
        assert_eq!(ws.unsaved(), vec![id.clone()]);
        assert!(ws.discard(&id));
        assert!(ws.unsaved().is_empty());
    }

    #[test]
    fn test_close_session_purges_everything() {
        let (ws, id) = workspace_with("n1");
        ws.set_current(Some(id.clone()));
        ws.update_content(&id, &Snapshot::from_paragraphs(&["x"]));
        ws.mark_unsaved(&id);

        ws.close_session(&id);
        assert!(ws.note(&id).is_none());
        assert!(ws.content_hash(&id).is_none());
        assert_eq!(ws.local_revision(&id), 0);
        assert!(!ws.is_unsaved(&id));
        assert!(ws.current().is_none());
        assert_eq!(ws.open_count(), 0);
    }
}
