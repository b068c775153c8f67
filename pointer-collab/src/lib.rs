//! # pointer-collab - collaborative sync for pointer notes
//!
//! Binds an editing session to a replicated document, keeps it connected
//! to the replication server and persists user edits to the durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  bind(id)   ┌───────────────┐
//! │ SessionBinder│ ──────────► │ SessionDriver │ (one task per session)
//! └──────────────┘             └──────┬────────┘
//!                                     │
//!        ┌──────────────┬─────────────┼───────────────┬──────────────┐
//!        ▼              ▼             ▼               ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌───────────┐ ┌─────────────┐ ┌───────────┐
//! │ Connection │ │ LocalEdit  │ │ Save      │ │ Presence    │ │ Transport │
//! │ Lifecycle  │ │ Observer   │ │ Scheduler │ │ Publisher   │ │ (ws/mem)  │
//! └────────────┘ └────────────┘ └─────┬─────┘ └─────────────┘ └─────┬─────┘
//!                                     ▼                             ▼
//!                               DurableStore                  RelayServer
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`]: Transport trait, WebSocket client, in-process hub
//! - [`relay`]: WebSocket relay server
//! - [`lifecycle`]: Connect/reconnect state machine
//! - [`observer`]: Classifies document updates as user edits or not
//! - [`scheduler`]: Save debounce
//! - [`store`]: Durable store of record
//! - [`workspace`]: Open notes and unsaved markers
//! - [`presence`]: Actor identity, colors and remote cursors
//! - [`editor`]: Editing-surface facade
//! - [`session`]: Session binder and driver

pub mod config;
pub mod editor;
pub mod lifecycle;
pub mod observer;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;
pub mod workspace;

// Re-exports for convenience
pub use config::SessionConfig;
pub use editor::{EditorError, EditorHandle};
pub use lifecycle::{ConnectionLifecycle, LifecycleAction};
pub use observer::{InitialContentLoadState, LocalEditObserver, Observation};
pub use presence::{
    palette_color, AuthIdentity, AwarenessMessage, ColorCache, LocalActor, PresencePublisher,
    PresenceRoom, RemotePeer, ANONYMOUS_COLOR, PALETTE,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use scheduler::SaveScheduler;
pub use session::{SessionBinder, SessionError, SessionHandle, SessionStatus, SyncContext};
pub use store::{
    DurableStore, FileStore, MemoryStore, NoteContent, NoteKind, NoteMetadata, StoreError,
    StoredDocument,
};
pub use transport::{
    ConnectionStatus, MemoryHub, MemoryTransport, OfflineQueue, Transport, TransportError,
    TransportEvent, TransportFactory, WebSocketTransport, WebSocketTransportFactory,
};
pub use workspace::Workspace;
