//! Resumable repository event ingestion for skyfeed.
//!
//! This crate subscribes to upstream repository event streams, classifies
//! each message into typed create/delete operations, hands the batches to an
//! event handler and checkpoints its position so a restart resumes where it
//! left off.
//!
//! # Modules
//!
//! - [`source`] - Stream adapters (firehose, Jetstream) and the websocket transport
//! - [`classify`] - Commit and event classification
//! - [`ingester`] - The reconnecting ingestion loop
//! - [`checkpoint`] - Cursor checkpoint abstraction
//! - [`store`] - SQLite feed index and checkpoint table
//! - [`handler`] - Event handlers (topic feed)
//! - [`manual`] - File-driven manual overrides
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Transport    │  websocket frames
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  StreamAdapter  │  decode + classify ──────────┐
//! └────────┬────────┘                              │ cursor every N messages
//!          │ OperationBatch                        ▼
//!          ▼                              ┌─────────────────┐
//! ┌─────────────────┐                     │ CheckpointStore │
//! │  EventHandler   │  ◀── ManualOverride └─────────────────┘
//! └─────────────────┘
//! ```

pub mod checkpoint;
pub mod classify;
pub mod error;
pub mod handler;
pub mod ingester;
pub mod manual;
pub mod source;
pub mod store;

pub use error::{Error, Result};

pub use checkpoint::{CheckpointStore, Cursor, MemoryCheckpointStore};
pub use handler::{EventHandler, FeedHandler, PostFilter};
pub use ingester::{IngestState, IngestStats, Ingester, IngesterConfig};
pub use manual::{AppViewResolver, ManualOverride, ManualOverrideConfig, PostResolver};
pub use source::{
    FirehoseAdapter, FirehoseConfig, Frame, FrameStream, JetstreamAdapter, JetstreamConfig,
    StreamAdapter, Transport, WebSocketConfig, WebSocketTransport,
};
pub use store::Database;
