//! Session binder: one live (document, transport) pair per bound note.
//!
//! ```text
//! SessionBinder::bind(id)
//!   │  1. tear down previous session (awaited)
//!   │  2. load note (workspace → durable store)
//!   │  3. fresh ReplicatedDocument (+ transport if collaborative)
//!   ▼
//! SessionDriver task ◄── SessionCommand ── SessionHandle (cloneable)
//!   │                                        │
//!   ├── document updates → observer → scheduler → DurableStore
//!   ├── transport events → lifecycle → editable flag
//!   └── watch<SessionStatus> ───────────────►┘
//! ```

mod driver;

use pointer_core::{CollabError, DocumentIdentity, ReplicatedDocument};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::editor::{EditorHandle, EditorState};
use crate::lifecycle::ConnectionLifecycle;
use crate::observer::InitialContentLoadState;
use crate::presence::{AuthIdentity, ColorCache, LocalActor, RemotePeer};
use crate::store::{DurableStore, StoreError};
use crate::transport::{ConnectionStatus, TransportError, TransportFactory};
use crate::workspace::Workspace;

use driver::SessionDriver;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("note {0} not found")]
    NotFound(DocumentIdentity),
    #[error("session closed")]
    Closed,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("document error: {0}")]
    Document(#[from] CollabError),
}

/// Everything sessions share for the lifetime of the host.
pub struct SyncContext {
    pub config: SessionConfig,
    pub workspace: Arc<Workspace>,
    pub store: Arc<dyn DurableStore>,
    pub transports: Arc<dyn TransportFactory>,
    pub actor: LocalActor,
    pub colors: Arc<ColorCache>,
}

impl SyncContext {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn DurableStore>,
        transports: Arc<dyn TransportFactory>,
        auth: Option<&AuthIdentity>,
    ) -> Self {
        let colors = Arc::new(ColorCache::new());
        let actor = LocalActor::from_auth(auth, &colors);
        Self {
            config,
            workspace: Arc::new(Workspace::new()),
            store,
            transports,
            actor,
            colors,
        }
    }
}

/// Observable state of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub connection: ConnectionStatus,
    pub synced: bool,
    pub reconnect_attempts: u32,
    /// Replication is active for this session.
    pub collaborative: bool,
    pub editable: bool,
    pub load_state: InitialContentLoadState,
}

impl SessionStatus {
    fn initial(collaborative: bool) -> Self {
        Self {
            connection: if collaborative {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Disconnected
            },
            synced: false,
            reconnect_attempts: 0,
            collaborative,
            editable: false,
            load_state: InitialContentLoadState::NotLoaded,
        }
    }
}

pub(crate) enum SessionCommand {
    SaveNow(oneshot::Sender<Result<(), SessionError>>),
    Disconnect,
    Reconnect,
    SetVisible(bool),
    Unload,
    PublishCursor { anchor: u32, head: u32 },
    Peers(oneshot::Sender<Vec<RemotePeer>>),
    Close(oneshot::Sender<()>),
}

/// Caller-side handle to a bound session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    identity: DocumentIdentity,
    editor: EditorHandle,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn identity(&self) -> &DocumentIdentity {
        &self.identity
    }

    pub fn editor(&self) -> &EditorHandle {
        &self.editor
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, SessionError> {
        let mut rx = self.status.clone();
        let status = rx.wait_for(predicate).await.map_err(|_| SessionError::Closed)?;
        Ok(status.clone())
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }

    /// Save immediately, cancelling any pending debounce.
    pub async fn save_now(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SaveNow(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect).await
    }

    /// Manual reconnect; allowed after automatic retries gave up.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Reconnect).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), SessionError> {
        self.send(SessionCommand::SetVisible(visible)).await
    }

    /// The hosting page is going away: leave and disconnect gracefully.
    pub async fn unload(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Unload).await
    }

    pub async fn publish_cursor(&self, anchor: u32, head: u32) -> Result<(), SessionError> {
        self.send(SessionCommand::PublishCursor { anchor, head }).await
    }

    pub async fn peers(&self) -> Result<Vec<RemotePeer>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Peers(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct BoundSession {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Owns the single live session of an editor host.
pub struct SessionBinder {
    ctx: Arc<SyncContext>,
    current: Option<BoundSession>,
}

impl SessionBinder {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx, current: None }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn current(&self) -> Option<&SessionHandle> {
        self.current.as_ref().map(|bound| &bound.handle)
    }

    /// Bind the editor to `identity`. Binding the identity that is already
    /// bound returns the live session.
    pub async fn bind(&mut self, identity: impl Into<DocumentIdentity>) -> Result<SessionHandle, SessionError> {
        let identity = identity.into();
        if let Some(bound) = &self.current {
            if bound.handle.identity == identity && !bound.task.is_finished() {
                return Ok(bound.handle.clone());
            }
        }
        self.teardown().await;

        let workspace = &self.ctx.workspace;
        let note = match workspace.note(&identity) {
            Some(note) => note,
            None => {
                let note = self
                    .ctx
                    .store
                    .read_document(&identity)
                    .await?
                    .ok_or_else(|| SessionError::NotFound(identity.clone()))?;
                workspace.open_note(identity.clone(), note.clone());
                note
            }
        };
        workspace.set_current(Some(identity.clone()));

        let collaborative = note.metadata.collaborative;
        let durable = note.content.snapshot();
        let document = Arc::new(ReplicatedDocument::new());
        let transport = collaborative.then(|| self.ctx.transports.create(&identity, document.clone()));

        let config = &self.ctx.config;
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let (status_tx, status_rx) = watch::channel(SessionStatus::initial(collaborative));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let editor_state = Arc::new(EditorState::new(document.clone()));
        let editor = EditorHandle::new(editor_state.clone(), signal_tx);

        log::info!(
            "Binding session {identity} ({})",
            if collaborative { "collaborative" } else { "local" }
        );

        let driver = SessionDriver::new(driver::DriverParts {
            identity: identity.clone(),
            ctx: self.ctx.clone(),
            document,
            transport,
            durable,
            is_file: note.is_file(),
            editor_state,
            signals: signal_rx,
            commands: command_rx,
            status: status_tx,
            lifecycle: ConnectionLifecycle::new(config.reconnect_delay, config.max_reconnect_attempts),
        })?;
        let task = tokio::spawn(driver.run());

        let handle = SessionHandle {
            identity,
            editor,
            commands: command_tx,
            status: status_rx,
        };
        self.current = Some(BoundSession {
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    /// Tear down the live session, if any, and wait for it to finish.
    pub async fn teardown(&mut self) {
        let Some(bound) = self.current.take() else {
            return;
        };
        bound.handle.close().await;
        if let Err(e) = bound.task.await {
            log::warn!("Session task for {} ended abnormally: {e}", bound.handle.identity);
        }
    }
}
