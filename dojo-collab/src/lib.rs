//! # dojo-collab: Real-time collaboration service for ScriptDojo rooms
//!
//! Serves the shared code editor over WebSocket using server-centric
//! operational transformation on top of `dojo-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐     ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────►│ SyncServer  │────►│ RoomRegistry │
//! │ (per user)  │    JSON on /ws     │ (per conn)  │     └──────┬───────┘
//! └──────┬──────┘                    └──────▲──────┘            │ mpsc
//!        │                                  │ outbox     ┌──────▼───────┐
//!        ▼                                  └────────────│ Room actor   │
//! ┌──────────────┐                                       │ Document+Log │
//! │ClientDocument│                                       └──────┬───────┘
//! │ (local OT)   │                                              │
//! └──────────────┘                                     CheckpointStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`config`]: Server configuration and environment overrides
//! - [`room`]: Per-room actor: sequencing, fan-out, lifecycle
//! - [`registry`]: Room id → room actor
//! - [`session`]: Sessions, identities and cursors
//! - [`presence`]: Presence projection and coalescing
//! - [`resync`]: Replay-or-snapshot catch-up
//! - [`broadcast`]: Per-session bounded outboxes
//! - [`storage`]: Checkpoints (memory, RocksDB)
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with local OT

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod resync;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Delivery};
pub use client::{ClientDocument, ClientOutcome, ConnectionState, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use error::CollabError;
pub use protocol::{ClientMessage, Frame, PresenceEntry, ProtocolError, ServerMessage, SnapshotReason};
pub use registry::RoomRegistry;
pub use room::{JoinAccepted, JoinRequest, Room, RoomHandle, RoomInfo, RoomState};
pub use server::{ServerStats, SyncServer};
pub use session::{Cursor, Session};
pub use storage::{Checkpoint, CheckpointStore, MemoryStore, RocksStore, StoreConfig, StoreError};
