//! Downstream event handlers.
//!
//! An [`EventHandler`] receives every classified batch from one or more
//! ingestion loops. It is initialized once with the shared database before
//! any loop starts, and owns its own retries and idempotence.

mod feed;
mod filter;

pub use feed::FeedHandler;
pub use filter::{DEFAULT_EXCLUDE_PATTERN, DEFAULT_INCLUDE_PATTERN, PostFilter};

use std::future::Future;
use std::sync::Arc;

use skyfeed_core::OperationBatch;

use crate::Result;
use crate::store::Database;

/// Sink for classified operation batches.
pub trait EventHandler: Send + Sync + 'static {
    /// Bind the handler to its store. Called once, before any `handle`.
    fn initialize(&self, store: Arc<Database>) -> impl Future<Output = Result<()>> + Send;

    /// Apply one batch. Called once per message, including empty batches.
    fn handle(&self, batch: OperationBatch) -> impl Future<Output = Result<()>> + Send;
}
