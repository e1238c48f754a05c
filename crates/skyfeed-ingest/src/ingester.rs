//! The ingestion loop.
//!
//! One [`Ingester`] owns one stream subscription. It pulls frames from the
//! transport, decodes and classifies them through its [`StreamAdapter`],
//! queues each batch for the [`EventHandler`] without waiting for it, and
//! persists the stream cursor every `checkpoint_interval` messages.
//!
//! Batches reach the handler in stream order. A single dispatcher task per
//! loop hands them over one at a time, across reconnects.
//!
//! # States
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Streaming
//!                     ▲             │ transport error
//!                     │             ▼
//!               Reconnecting ◀── Degraded
//! ```
//!
//! Any state moves to `Stopped` on shutdown. Malformed messages are dropped
//! and never cause a reconnect; transport errors always do, after a fixed
//! delay, resuming from the last *persisted* cursor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use skyfeed_core::OperationBatch;
use skyfeed_core::metrics::{increment_source, set_source_gauge};
use tokio::sync::{mpsc, oneshot, watch};

use crate::checkpoint::{CheckpointStore, Cursor};
use crate::handler::EventHandler;
use crate::source::{StreamAdapter, Transport};
use crate::{Error, Result};

/// Configuration for an ingestion loop.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Fixed wait between a failed session and the next attempt.
    pub reconnect_delay: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(3000),
        }
    }
}

/// Lifecycle state of an ingestion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    /// Not started.
    Disconnected,
    /// Reading the checkpoint and opening a session.
    Connecting,
    /// At least one message received in the current session.
    Streaming,
    /// The session failed.
    Degraded,
    /// Waiting out the reconnect delay.
    Reconnecting,
    /// Shut down.
    Stopped,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        }
    }
}

/// Snapshot of an ingestion loop's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Messages decoded and dispatched.
    pub messages: u64,
    /// Frames dropped as malformed.
    pub invalid_messages: u64,
    /// Successful checkpoint writes.
    pub checkpoints_written: u64,
    /// Failed checkpoint writes.
    pub checkpoint_errors: u64,
    /// Sessions restarted after a failure.
    pub reconnects: u64,
    /// Batches the handler reported as failed.
    pub handler_errors: u64,
}

/// Work for the dispatcher task.
enum Dispatch {
    Batch(OperationBatch),
    /// Answered once every batch queued before it has been handled.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    invalid_messages: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoint_errors: AtomicU64,
    reconnects: AtomicU64,
    handler_errors: AtomicU64,
}

/// Resumable ingestion loop for one stream adapter.
pub struct Ingester<A: StreamAdapter, H: EventHandler> {
    config: IngesterConfig,
    adapter: Arc<A>,
    transport: Arc<dyn Transport>,
    checkpoints: Arc<dyn CheckpointStore>,
    handler: Arc<H>,
    state: RwLock<IngestState>,
    stats: Arc<Counters>,
    /// Last cursor this loop persisted successfully.
    last_persisted: Mutex<Option<Cursor>>,
}

impl<A: StreamAdapter, H: EventHandler> Ingester<A, H> {
    /// Create an ingestion loop.
    ///
    /// The handler must already be initialized; it may be shared with other
    /// loops.
    pub fn new(
        config: IngesterConfig,
        adapter: A,
        transport: Arc<dyn Transport>,
        checkpoints: Arc<dyn CheckpointStore>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            config,
            adapter: Arc::new(adapter),
            transport,
            checkpoints,
            handler,
            state: RwLock::new(IngestState::Disconnected),
            stats: Arc::new(Counters::default()),
            last_persisted: Mutex::new(None),
        }
    }

    pub fn state(&self) -> IngestState {
        *self.state.read()
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            messages: self.stats.messages.load(Ordering::Relaxed),
            invalid_messages: self.stats.invalid_messages.load(Ordering::Relaxed),
            checkpoints_written: self.stats.checkpoints_written.load(Ordering::Relaxed),
            checkpoint_errors: self.stats.checkpoint_errors.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            handler_errors: self.stats.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Run until `shutdown` becomes `true`.
    ///
    /// Reconnects indefinitely on transport failures. On shutdown, waits for
    /// the queued batches to be handled and then persists the latest cursor.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let name = self.adapter.name();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_batches(
            name,
            self.handler.clone(),
            dispatch_rx,
            self.stats.clone(),
        ));

        set_source_gauge("ingest_running", name, 1.0);
        tracing::info!(
            "Starting {} ingestion for {}",
            name,
            self.adapter.subscription_id()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(IngestState::Connecting);
            let cursor = self.load_cursor();

            match self.run_session(cursor, &mut shutdown, &dispatch_tx).await {
                Ok(()) => break,
                Err(e) => {
                    self.set_state(IngestState::Degraded);
                    tracing::error!("{} stream errored: {}", name, e);

                    self.set_state(IngestState::Reconnecting);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    increment_source("ingest_reconnects_total", name, 1);
                    tracing::info!(
                        "Reconnecting {} in {:?}",
                        name,
                        self.config.reconnect_delay
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }
        }

        drop(dispatch_tx);
        if let Err(e) = dispatcher.await {
            tracing::error!("{} dispatcher failed: {}", name, e);
        }

        self.set_state(IngestState::Stopped);
        set_source_gauge("ingest_running", name, 0.0);
        tracing::info!("{} ingestion stopped", name);
    }

    /// One connection lifetime. `Ok` means shutdown was requested.
    async fn run_session(
        &self,
        cursor: Option<Cursor>,
        shutdown: &mut watch::Receiver<bool>,
        dispatch: &mpsc::UnboundedSender<Dispatch>,
    ) -> Result<()> {
        let name = self.adapter.name();
        let url = self.adapter.resume_url(cursor)?;
        match cursor {
            Some(cursor) => tracing::info!("Connecting {} at cursor {}: {}", name, cursor, url),
            None => tracing::info!("Connecting {} from the live head: {}", name, url),
        }

        let mut frames = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return Ok(()),
            opened = self.transport.open(&url) => opened?,
        };

        let interval = self.adapter.checkpoint_interval().max(1);
        let mut since_checkpoint: u64 = 0;
        let mut latest: Option<Cursor> = None;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => break Ok(()),
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Err(e),
                None => break Err(Error::StreamClosed),
            };

            let message = match self.adapter.decode_frame(frame) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) if e.is_transport() => break Err(e),
                Err(e) => {
                    self.stats.invalid_messages.fetch_add(1, Ordering::Relaxed);
                    increment_source("ingest_messages_invalid_total", name, 1);
                    tracing::warn!("{} skipped invalid message: {}", name, e);
                    continue;
                }
            };

            self.stats.messages.fetch_add(1, Ordering::Relaxed);
            increment_source("ingest_messages_total", name, 1);
            if self.state() != IngestState::Streaming {
                self.set_state(IngestState::Streaming);
                tracing::info!("{} streaming", name);
            }

            let position = self.adapter.cursor(&message);
            latest = Some(position);

            let batch = self.adapter.classify(&message);
            tracing::trace!("{} message {} -> {} ops", name, position, batch.len());

            if dispatch.send(Dispatch::Batch(batch)).is_err() {
                tracing::error!("{} dispatcher is gone, dropping message {}", name, position);
            }

            since_checkpoint += 1;
            if since_checkpoint >= interval {
                since_checkpoint = 0;
                self.persist(position);
            }
        };

        if outcome.is_ok() {
            tracing::info!("Draining {} handler queue", name);
            let (done_tx, done_rx) = oneshot::channel();
            if dispatch.send(Dispatch::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
            if let Some(cursor) = latest {
                self.persist(cursor);
            }
        }

        outcome
    }

    /// Read the persisted cursor, falling back to the last one this loop wrote.
    fn load_cursor(&self) -> Option<Cursor> {
        match self.checkpoints.get_cursor(self.adapter.subscription_id()) {
            Ok(cursor) => cursor,
            Err(e) => {
                let fallback = *self.last_persisted.lock();
                tracing::warn!(
                    "Failed to read {} checkpoint, resuming from {:?}: {}",
                    self.adapter.name(),
                    fallback,
                    e
                );
                fallback
            }
        }
    }

    fn persist(&self, cursor: Cursor) {
        let name = self.adapter.name();
        match self
            .checkpoints
            .set_cursor(self.adapter.subscription_id(), cursor)
        {
            Ok(()) => {
                let mut last = self.last_persisted.lock();
                *last = Some(last.map_or(cursor, |prev| prev.max(cursor)));
                self.stats.checkpoints_written.fetch_add(1, Ordering::Relaxed);
                increment_source("ingest_checkpoint_writes_total", name, 1);
                set_source_gauge("ingest_cursor", name, cursor.value() as f64);
                tracing::debug!("{} checkpoint at {}", name, cursor);
            }
            Err(e) => {
                self.stats.checkpoint_errors.fetch_add(1, Ordering::Relaxed);
                increment_source("ingest_checkpoint_errors_total", name, 1);
                tracing::warn!("Failed to persist {} cursor {}: {}", name, cursor, e);
            }
        }
    }

    fn set_state(&self, state: IngestState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!(
                "{} state {} -> {}",
                self.adapter.name(),
                current.as_str(),
                state.as_str()
            );
            *current = state;
        }
    }
}

/// Hand queued batches to the handler one at a time, in queue order.
///
/// Each call runs in its own task so a panicking handler is reported like a
/// failed one and does not stop the dispatcher.
async fn dispatch_batches<H: EventHandler>(
    name: &'static str,
    handler: Arc<H>,
    mut queue: mpsc::UnboundedReceiver<Dispatch>,
    stats: Arc<Counters>,
) {
    while let Some(item) = queue.recv().await {
        let batch = match item {
            Dispatch::Batch(batch) => batch,
            Dispatch::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let handler = handler.clone();
        let failure = match tokio::spawn(async move { handler.handle(batch).await }).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("handler task failed: {}", e),
        };

        stats.handler_errors.fetch_add(1, Ordering::Relaxed);
        counter!("ingest_handler_errors_total").increment(1);
        tracing::error!("{} handler could not handle message: {}", name, failure);
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert_eq!(
            IngesterConfig::default().reconnect_delay,
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn test_state_names() {
        assert_eq!(IngestState::Streaming.as_str(), "streaming");
        assert_eq!(IngestState::Reconnecting.as_str(), "reconnecting");
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_pends_without_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result =
            tokio::time::timeout(Duration::from_millis(50), wait_for_shutdown(&mut rx)).await;
        assert!(result.is_err());
    }
}
