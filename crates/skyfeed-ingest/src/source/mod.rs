//! Upstream stream adapters.
//!
//! An ingestion loop pulls [`Frame`]s from a [`Transport`] and turns them
//! into typed messages through a [`StreamAdapter`]. The two wire formats
//! differ only in the adapter, so the loop itself has no per-format branches.
//!
//! # Available Adapters
//!
//! - [`FirehoseAdapter`] - full repository commits as DAG-CBOR frames
//! - [`JetstreamAdapter`] - flattened single-operation JSON events
//!
//! # Transports
//!
//! - [`WebSocketTransport`] - tokio-tungstenite client with keep-alive pings

pub mod firehose;
pub mod jetstream;
pub mod params;
mod websocket;

pub use firehose::{Commit, FirehoseAdapter, FirehoseConfig, RepoOp};
pub use jetstream::{JetstreamAdapter, JetstreamConfig, JetstreamEvent};
pub use params::{ParamValue, encode_query_params};
pub use websocket::{WebSocketConfig, WebSocketTransport};

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use skyfeed_core::OperationBatch;

use crate::Result;
use crate::checkpoint::Cursor;

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// A session's frames. Ends or yields an error when the session is over.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Opens stream sessions against an upstream URL.
pub trait Transport: Send + Sync {
    fn open<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FrameStream>> + Send + 'a>>;
}

/// A wire protocol: how to address, decode and classify one upstream stream.
///
/// `decode_frame` reports three outcomes:
/// - `Ok(Some(message))` for a stream message
/// - `Ok(None)` for frames that carry no message (other event types)
/// - `Err(e)`: when `e.is_transport()` the session is over; otherwise the
///   frame is malformed and is dropped
pub trait StreamAdapter: Send + Sync + 'static {
    type Message: Send + 'static;

    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Checkpoint key for this stream.
    fn subscription_id(&self) -> &str;

    /// Persist the cursor every this many messages.
    fn checkpoint_interval(&self) -> u64;

    /// URL for a new session resuming at or after `cursor`.
    fn resume_url(&self, cursor: Option<Cursor>) -> Result<String>;

    fn decode_frame(&self, frame: Frame) -> Result<Option<Self::Message>>;

    /// Stream position carried by a message.
    fn cursor(&self, message: &Self::Message) -> Cursor;

    fn classify(&self, message: &Self::Message) -> OperationBatch;
}
