//! Per-session event loop.
//!
//! One task owns every piece of mutable session state, so timers, transport
//! events and document updates are handled strictly one at a time.

use pointer_core::{CollabError, DocumentIdentity, ReplicatedDocument, Snapshot, UpdateOrigin};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use yrs::Subscription;

use super::{SessionCommand, SessionError, SessionStatus, SyncContext};
use crate::editor::{EditorSignal, EditorState};
use crate::lifecycle::{ConnectionLifecycle, LifecycleAction};
use crate::observer::{InitialContentLoadState, LocalEditObserver, Observation};
use crate::presence::PresencePublisher;
use crate::scheduler::SaveScheduler;
use crate::store::{NoteContent, NoteKind, StoredDocument};
use crate::transport::{ConnectionStatus, Transport, TransportEvent};

pub(super) struct DriverParts {
    pub identity: DocumentIdentity,
    pub ctx: Arc<SyncContext>,
    pub document: Arc<ReplicatedDocument>,
    pub transport: Option<Box<dyn Transport>>,
    pub durable: Snapshot,
    pub is_file: bool,
    pub editor_state: Arc<EditorState>,
    pub signals: mpsc::UnboundedReceiver<EditorSignal>,
    pub commands: mpsc::Receiver<SessionCommand>,
    pub status: watch::Sender<SessionStatus>,
    pub lifecycle: ConnectionLifecycle,
}

type UpdateFeed = mpsc::UnboundedReceiver<(UpdateOrigin, Vec<u8>)>;

fn subscribe(document: &ReplicatedDocument) -> Result<(Subscription, UpdateFeed), CollabError> {
    let (update_tx, updates) = mpsc::unbounded_channel();
    let subscription = document.observe_updates(move |origin, update| {
        let _ = update_tx.send((origin, update.to_vec()));
    })?;
    Ok((subscription, updates))
}

pub(super) struct SessionDriver {
    identity: DocumentIdentity,
    ctx: Arc<SyncContext>,
    document: Option<Arc<ReplicatedDocument>>,
    transport: Option<Arc<dyn Transport>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    updates: UpdateFeed,
    subscription: Option<Subscription>,
    editor_state: Arc<EditorState>,
    signals: mpsc::UnboundedReceiver<EditorSignal>,
    commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<SessionStatus>,
    lifecycle: ConnectionLifecycle,
    observer: LocalEditObserver,
    scheduler: SaveScheduler,
    presence: PresencePublisher,
    connect_task: Option<JoinHandle<()>>,
    heartbeat_at: Option<Instant>,
    durable: Snapshot,
    is_file: bool,
    initial_sync_seen: bool,
    replicating: bool,
}

impl SessionDriver {
    pub(super) fn new(parts: DriverParts) -> Result<Self, SessionError> {
        let DriverParts {
            identity,
            ctx,
            document,
            transport,
            durable,
            is_file,
            editor_state,
            signals,
            commands,
            status,
            lifecycle,
        } = parts;

        let (subscription, updates) = subscribe(&document)?;

        let mut transport = transport;
        let events = transport.as_mut().and_then(|t| t.take_events());
        let transport: Option<Arc<dyn Transport>> = transport.map(Arc::from);

        let replicating = transport.is_some();
        let config = &ctx.config;
        let scheduler = SaveScheduler::new(config.save_delay(replicating));
        let presence = PresencePublisher::new(
            ctx.actor.clone(),
            config.cursor_broadcast_interval,
            config.presence_idle_timeout,
        );

        Ok(Self {
            observer: LocalEditObserver::new(identity.clone()),
            identity,
            ctx,
            document: Some(document),
            transport,
            events,
            updates,
            subscription: Some(subscription),
            editor_state,
            signals,
            commands,
            status,
            lifecycle,
            scheduler,
            presence,
            connect_task: None,
            heartbeat_at: None,
            durable,
            is_file,
            initial_sync_seen: false,
            replicating,
        })
    }

    pub(super) async fn run(mut self) {
        self.start();
        self.publish_status();

        loop {
            let save_deadline = self.scheduler.deadline();
            let reconnect_deadline = if self.replicating {
                self.lifecycle.reconnect_deadline()
            } else {
                None
            };
            let heartbeat_deadline = if self.replicating && self.lifecycle.status() == ConnectionStatus::Connected {
                self.heartbeat_at
            } else {
                None
            };

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },

                Some(signal) = self.signals.recv() => match signal {
                    EditorSignal::ContentError(message) => self.disable_replication(&message).await,
                },

                Some((origin, update)) = self.updates.recv() => self.handle_update(origin, update).await,

                Some(event) = next_event(&mut self.events) => self.handle_event(event).await,

                _ = sleep_until_some(save_deadline) => {
                    if self.scheduler.take_due(Instant::now()) {
                        self.spawn_save(None);
                    }
                }

                _ = sleep_until_some(reconnect_deadline) => {
                    if self.lifecycle.poll_reconnect(Instant::now()) {
                        self.spawn_connect();
                    }
                }

                _ = sleep_until_some(heartbeat_deadline) => self.announce_presence().await,
            }

            self.publish_status();
        }
    }

    // ── Startup ──────────────────────────────────────────────────

    fn start(&mut self) {
        if self.replicating {
            self.spawn_connect();
        } else {
            // Nothing to wait for: the durable snapshot is the only source.
            self.finish_initial_load();
        }
    }

    fn spawn_connect(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        if let Some(previous) = self.connect_task.take() {
            previous.abort();
        }
        let identity = self.identity.clone();
        self.connect_task = Some(tokio::spawn(async move {
            if let Err(e) = transport.connect().await {
                log::debug!("Connect for {identity} failed: {e}");
            }
        }));
    }

    /// One-time choice of initial content: peer state, durable snapshot or
    /// nothing. Later `synced` events never get here again.
    fn finish_initial_load(&mut self) {
        if self.initial_sync_seen {
            return;
        }
        self.initial_sync_seen = true;
        let Some(document) = self.document.clone() else {
            return;
        };

        let state = if document.has_content() {
            InitialContentLoadState::LoadedFromPeer
        } else if !self.durable.is_empty() {
            match document.seed(&self.durable) {
                Ok(_) => InitialContentLoadState::LoadedFromDurable,
                Err(e) => {
                    log::warn!("Seeding {} from durable snapshot failed: {e}", self.identity);
                    InitialContentLoadState::StartedEmpty
                }
            }
        } else {
            InitialContentLoadState::StartedEmpty
        };
        log::info!("Initial content for {}: {state:?}", self.identity);

        match document.snapshot() {
            Ok(snapshot) => {
                let target = self.ctx.workspace.current();
                self.observer
                    .observe(UpdateOrigin::Bootstrap, &snapshot, target.as_ref(), self.is_file);
                if state == InitialContentLoadState::LoadedFromPeer {
                    self.ctx.workspace.update_content(&self.identity, &snapshot);
                }
            }
            Err(e) => log::warn!("Unreadable initial content for {}: {e}", self.identity),
        }
        self.observer.set_load_state(state);
    }

    // ── Document updates ─────────────────────────────────────────

    async fn handle_update(&mut self, origin: UpdateOrigin, update: Vec<u8>) {
        if self.replicating && origin != UpdateOrigin::Remote {
            if let Some(transport) = &self.transport {
                if let Err(e) = transport.send_update(update).await {
                    log::warn!("Failed to send update for {}: {e}", self.identity);
                }
            }
        }

        let Some(document) = self.document.clone() else {
            return;
        };
        let snapshot = match document.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.disable_replication(&format!("unreadable document: {e}")).await;
                return;
            }
        };

        let target = self.ctx.workspace.current();
        match self.observer.observe(origin, &snapshot, target.as_ref(), self.is_file) {
            Observation::RemoteApplied { changed: true } => {
                self.ctx.workspace.update_content(&self.identity, &snapshot);
            }
            Observation::Significant { .. } => {
                self.ctx.workspace.update_content(&self.identity, &snapshot);
                self.ctx.workspace.mark_unsaved(&self.identity);
                self.scheduler.touch(Instant::now());
            }
            _ => {}
        }
    }

    /// Malformed content: continue without replication, on a document that
    /// still reads.
    async fn disable_replication(&mut self, reason: &str) {
        if self.replicating {
            log::warn!("Disabling collaboration for {}: {reason}", self.identity);
            self.replicating = false;
            self.lifecycle.disconnect();
            self.heartbeat_at = None;
            if let Some(task) = self.connect_task.take() {
                task.abort();
            }
            self.events = None;
            if let Some(transport) = self.transport.take() {
                let _ = transport.send_awareness(&self.presence.leave_message()).await;
                if let Err(e) = transport.disconnect().await {
                    log::debug!("Ignoring close error for {}: {e}", self.identity);
                }
            }
            self.presence.room_mut().clear();
            self.scheduler.set_window(self.ctx.config.save_delay(false));
        } else {
            log::warn!("Content problem in local session {}: {reason}", self.identity);
        }
        self.replace_unreadable_document();
        self.finish_initial_load();
    }

    /// Swap a document whose tree no longer reads for a fresh one holding the
    /// last good content: the workspace copy, else the durable snapshot.
    /// Before the initial load the fresh document starts empty and the load
    /// seeds it as usual.
    fn replace_unreadable_document(&mut self) {
        let Some(document) = &self.document else {
            return;
        };
        if document.snapshot().is_ok() {
            return;
        }

        let last_good = if self.initial_sync_seen {
            self.ctx
                .workspace
                .note(&self.identity)
                .map(|note| note.content.snapshot())
                .unwrap_or_else(|| self.durable.clone())
        } else {
            Snapshot::empty()
        };

        let fresh = Arc::new(ReplicatedDocument::new());
        if !last_good.is_empty() {
            if let Err(e) = fresh.seed(&last_good) {
                log::warn!("Reseeding {} failed: {e}", self.identity);
            }
        }
        let (subscription, updates) = match subscribe(&fresh) {
            Ok(feed) => feed,
            Err(e) => {
                log::error!("Cannot observe replacement document for {}: {e}", self.identity);
                return;
            }
        };

        log::warn!("Replaced unreadable document for {} with its last good content", self.identity);
        self.subscription = Some(subscription);
        self.updates = updates;
        self.editor_state.replace_document(fresh.clone());
        self.document = Some(fresh);
        if self.initial_sync_seen {
            self.observer.record(&last_good);
        }
    }

    // ── Transport events ─────────────────────────────────────────

    async fn handle_event(&mut self, event: TransportEvent) {
        if !self.replicating {
            return;
        }
        let connected = match event {
            TransportEvent::Connect => self.lifecycle.on_connect(),
            TransportEvent::Status(status) => {
                self.lifecycle.on_status(status) && status == ConnectionStatus::Connected
            }
            TransportEvent::Synced => {
                if self.lifecycle.on_synced() {
                    log::debug!("Session {} synced", self.identity);
                }
                self.finish_initial_load();
                false
            }
            TransportEvent::ConnectionError { message } => {
                self.lifecycle.on_error(&message);
                false
            }
            TransportEvent::Disconnect => {
                self.lifecycle.on_disconnect();
                false
            }
            TransportEvent::Awareness(msg) => {
                self.presence.handle_remote(&msg);
                false
            }
        };

        if connected {
            self.announce_presence().await;
        }
    }

    /// Send our join and schedule the next one, so quiet peers still see us.
    async fn announce_presence(&mut self) {
        self.heartbeat_at = Some(Instant::now() + self.ctx.config.presence_heartbeat_interval);
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send_awareness(&self.presence.join_message()).await {
                log::debug!("Presence join for {} not sent: {e}", self.identity);
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SaveNow(reply) => {
                // Classify edits already made so the marker matches what gets written.
                while let Ok((origin, update)) = self.updates.try_recv() {
                    self.handle_update(origin, update).await;
                }
                self.scheduler.cancel();
                self.spawn_save(Some(reply));
            }
            SessionCommand::Disconnect => self.disconnect_transport(false).await,
            SessionCommand::Unload => self.disconnect_transport(true).await,
            SessionCommand::Reconnect => {
                if self.replicating {
                    self.lifecycle.reconnect();
                    self.spawn_connect();
                }
            }
            SessionCommand::SetVisible(visible) => {
                if !self.replicating {
                    return;
                }
                match self.lifecycle.set_visible(visible) {
                    LifecycleAction::Connect => self.spawn_connect(),
                    LifecycleAction::Disconnect => self.close_transport(false).await,
                    LifecycleAction::Nothing => {}
                }
            }
            SessionCommand::PublishCursor { anchor, head } => {
                if !self.replicating || !self.lifecycle.is_editable() {
                    return;
                }
                if let (Some(msg), Some(transport)) =
                    (self.presence.update_local_cursor(anchor, head), &self.transport)
                {
                    let _ = transport.send_awareness(&msg).await;
                }
            }
            SessionCommand::Peers(reply) => {
                self.presence.room_mut().cleanup_idle_peers();
                let _ = reply.send(self.presence.room().peers());
            }
            SessionCommand::Close(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn disconnect_transport(&mut self, leave: bool) {
        if !self.replicating {
            return;
        }
        self.lifecycle.disconnect();
        self.close_transport(leave).await;
    }

    async fn close_transport(&mut self, leave: bool) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(transport) = &self.transport {
            if leave {
                let _ = transport.send_awareness(&self.presence.leave_message()).await;
            }
            if let Err(e) = transport.disconnect().await {
                log::debug!("Ignoring close error for {}: {e}", self.identity);
            }
        }
        self.presence.room_mut().clear();
    }

    // ── Saving ───────────────────────────────────────────────────

    fn spawn_save(&mut self, reply: Option<oneshot::Sender<Result<(), SessionError>>>) {
        let snapshot = match self.document.as_ref().map(|d| d.snapshot()) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(e)) => {
                log::warn!("Cannot save {}: {e}", self.identity);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
                return;
            }
            None => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SessionError::Closed));
                }
                return;
            }
        };

        let revision = self.ctx.workspace.local_revision(&self.identity);
        let mut note = self.ctx.workspace.note(&self.identity).unwrap_or_else(|| {
            StoredDocument::new(self.identity.as_str(), NoteKind::File, self.replicating, &snapshot)
        });
        note.content = NoteContent::from_snapshot(&snapshot);
        note.touch();

        let store = self.ctx.store.clone();
        let workspace = self.ctx.workspace.clone();
        let identity = self.identity.clone();
        tokio::spawn(async move {
            let result = store.write_document(&identity, &note).await;
            match &result {
                Ok(()) => {
                    workspace.mark_saved(&identity, revision);
                    log::debug!("Saved {identity}");
                }
                Err(e) => log::warn!("Failed to save {identity}: {e}"),
            }
            if let Some(reply) = reply {
                let _ = reply.send(result.map_err(SessionError::from));
            }
        });
    }

    // ── Status ───────────────────────────────────────────────────

    fn editable(&self) -> bool {
        if self.document.is_none() {
            return false;
        }
        if self.replicating {
            self.lifecycle.is_editable()
        } else {
            self.observer.load_state().is_terminal()
        }
    }

    fn publish_status(&self) {
        let editable = self.editable();
        self.editor_state.set_editable(editable);

        let connection = if self.replicating && self.document.is_some() {
            self.lifecycle.status()
        } else {
            ConnectionStatus::Disconnected
        };
        let status = SessionStatus {
            connection,
            synced: self.replicating && self.lifecycle.is_synced(),
            reconnect_attempts: self.lifecycle.attempts(),
            collaborative: self.replicating,
            editable,
            load_state: self.observer.load_state(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    // ── Teardown ─────────────────────────────────────────────────

    async fn teardown(&mut self) {
        if self.document.is_none() {
            return;
        }
        log::info!("Tearing down session {}", self.identity);

        self.scheduler.cancel();

        self.lifecycle.disconnect();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        self.subscription = None;
        self.events = None;

        if let Some(transport) = self.transport.take() {
            if self.replicating {
                let _ = transport.send_awareness(&self.presence.leave_message()).await;
            }
            if let Err(e) = transport.disconnect().await {
                log::debug!("Ignoring close error for {}: {e}", self.identity);
            }
        }

        self.editor_state.close();
        self.document = None;
        self.publish_status();
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
