//! Local edit observer.
//!
//! Decides, for every shared-document update, whether it is a user edit
//! worth persisting. Order of checks:
//!
//! ```text
//! first update ever ──────────────► FirstUpdateIgnored
//! still hydrating ────────────────► Hydrating        (hash only)
//! edited note ≠ session note ─────► WrongDocument    (dropped)
//! remote / bootstrap origin ──────► RemoteApplied    (no unsaved marker)
//! same hash as last time ─────────► Unchanged
//! empty and not a file ───────────► Insignificant
//! otherwise ──────────────────────► Significant
//! ```

use pointer_core::{ContentHash, DocumentIdentity, Snapshot, UpdateOrigin};

/// How the session's initial content got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialContentLoadState {
    NotLoaded,
    LoadedFromPeer,
    LoadedFromDurable,
    StartedEmpty,
}

impl InitialContentLoadState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InitialContentLoadState::NotLoaded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    FirstUpdateIgnored,
    Hydrating,
    WrongDocument,
    RemoteApplied { changed: bool },
    Unchanged,
    Insignificant,
    Significant { hash: ContentHash },
}

#[derive(Debug)]
pub struct LocalEditObserver {
    identity: DocumentIdentity,
    ignore_first_update: bool,
    last_hash: Option<ContentHash>,
    load_state: InitialContentLoadState,
}

impl LocalEditObserver {
    pub fn new(identity: DocumentIdentity) -> Self {
        Self {
            identity,
            ignore_first_update: true,
            last_hash: None,
            load_state: InitialContentLoadState::NotLoaded,
        }
    }

    pub fn identity(&self) -> &DocumentIdentity {
        &self.identity
    }

    pub fn load_state(&self) -> InitialContentLoadState {
        self.load_state
    }

    pub fn set_load_state(&mut self, state: InitialContentLoadState) {
        self.load_state = state;
    }

    pub fn last_hash(&self) -> Option<ContentHash> {
        self.last_hash
    }

    /// Record `snapshot` as the baseline without classifying it.
    pub fn record(&mut self, snapshot: &Snapshot) {
        self.last_hash = Some(snapshot.content_hash());
    }

    /// Classify one update. `target` is the note the host currently edits.
    pub fn observe(
        &mut self,
        origin: UpdateOrigin,
        snapshot: &Snapshot,
        target: Option<&DocumentIdentity>,
        is_file: bool,
    ) -> Observation {
        let hash = snapshot.content_hash();

        if self.ignore_first_update {
            self.ignore_first_update = false;
            self.last_hash = Some(hash);
            return Observation::FirstUpdateIgnored;
        }

        if !self.load_state.is_terminal() {
            self.last_hash = Some(hash);
            return Observation::Hydrating;
        }

        if target != Some(&self.identity) {
            log::warn!(
                "Update attempted for wrong note ID: session {}, target {:?}",
                self.identity,
                target.map(DocumentIdentity::as_str)
            );
            return Observation::WrongDocument;
        }

        let changed = self.last_hash != Some(hash);
        if origin.is_programmatic() {
            self.last_hash = Some(hash);
            return Observation::RemoteApplied { changed };
        }

        if !changed {
            return Observation::Unchanged;
        }

        self.last_hash = Some(hash);
        if snapshot.is_empty() && !is_file {
            return Observation::Insignificant;
        }
        Observation::Significant { hash }
    }

    /// Forget everything about the previous document.
    pub fn reset(&mut self, identity: DocumentIdentity) {
        *self = Self::new(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(id: &str) -> LocalEditObserver {
        let mut observer = LocalEditObserver::new(DocumentIdentity::from(id));
        observer.observe(UpdateOrigin::Bootstrap, &Snapshot::empty(), None, true);
        observer.set_load_state(InitialContentLoadState::StartedEmpty);
        observer
    }

    #[test]
    fn test_first_update_is_ignored() {
        let id = DocumentIdentity::from("n1");
        let mut observer = LocalEditObserver::new(id.clone());
        observer.set_load_state(InitialContentLoadState::LoadedFromDurable);
        let snap = Snapshot::from_paragraphs(&["seeded"]);
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, Some(&id), true),
            Observation::FirstUpdateIgnored
        );
        assert_eq!(observer.last_hash(), Some(snap.content_hash()));
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, Some(&id), true),
            Observation::Unchanged
        );
    }

    #[test]
    fn test_hydrating_updates_only_hash() {
        let id = DocumentIdentity::from("n1");
        let mut observer = LocalEditObserver::new(id.clone());
        observer.observe(UpdateOrigin::Remote, &Snapshot::empty(), Some(&id), true);

        let partial = Snapshot::from_paragraphs(&["partial"]);
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &partial, Some(&id), true),
            Observation::Hydrating
        );
        assert_eq!(observer.last_hash(), Some(partial.content_hash()));
    }

    #[test]
    fn test_significant_local_edit() {
        let id = DocumentIdentity::from("n1");
        let mut observer = loaded("n1");
        let snap = Snapshot::from_paragraphs(&["typed"]);
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, Some(&id), true),
            Observation::Significant { hash: snap.content_hash() }
        );
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, Some(&id), true),
            Observation::Unchanged
        );
    }

    #[test]
    fn test_remote_updates_never_significant() {
        let id = DocumentIdentity::from("n1");
        let mut observer = loaded("n1");
        let snap = Snapshot::from_paragraphs(&["from peer"]);
        assert_eq!(
            observer.observe(UpdateOrigin::Remote, &snap, Some(&id), true),
            Observation::RemoteApplied { changed: true }
        );
        assert_eq!(
            observer.observe(UpdateOrigin::Remote, &snap, Some(&id), true),
            Observation::RemoteApplied { changed: false }
        );
        // a local no-op afterwards compares against the remote hash
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, Some(&id), true),
            Observation::Unchanged
        );
    }

    #[test]
    fn test_empty_document_only_significant_for_files() {
        let id = DocumentIdentity::from("n1");
        let mut observer = loaded("n1");
        observer.observe(UpdateOrigin::Local, &Snapshot::from_paragraphs(&["x"]), Some(&id), false);

        let cleared = Snapshot::from_paragraphs(&[""]);
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &cleared, Some(&id), false),
            Observation::Insignificant
        );

        let mut file_observer = loaded("n1");
        file_observer.observe(UpdateOrigin::Local, &Snapshot::from_paragraphs(&["x"]), Some(&id), true);
        assert!(matches!(
            file_observer.observe(UpdateOrigin::Local, &cleared, Some(&id), true),
            Observation::Significant { .. }
        ));
    }

    #[test]
    fn test_wrong_document_is_dropped() {
        let mut observer = loaded("n1");
        let other = DocumentIdentity::from("n2");
        let snap = Snapshot::from_paragraphs(&["stray"]);
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, Some(&other), true),
            Observation::WrongDocument
        );
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &snap, None, true),
            Observation::WrongDocument
        );
        assert_ne!(observer.last_hash(), Some(snap.content_hash()));
    }

    #[test]
    fn test_reset_restores_first_update_guard() {
        let mut observer = loaded("n1");
        observer.reset(DocumentIdentity::from("n2"));
        assert_eq!(observer.identity().as_str(), "n2");
        assert_eq!(observer.load_state(), InitialContentLoadState::NotLoaded);
        assert!(observer.last_hash().is_none());
        assert_eq!(
            observer.observe(UpdateOrigin::Local, &Snapshot::empty(), None, true),
            Observation::FirstUpdateIgnored
        );
    }
}
