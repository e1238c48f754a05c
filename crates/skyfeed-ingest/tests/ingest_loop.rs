//! Ingestion loop behaviour against a scripted transport.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use skyfeed_core::{ContentKind, DeleteOp, OperationBatch, TypedOperation};
use skyfeed_ingest::{
    CheckpointStore, Cursor, Database, Error, EventHandler, Frame, FrameStream, IngestState,
    Ingester, IngesterConfig, MemoryCheckpointStore, Result, StreamAdapter, Transport,
};
use tokio::sync::watch;

const SUBSCRIPTION: &str = "test://seq";

/// Text frames carry a decimal sequence number. `bad` is malformed.
struct SeqAdapter {
    interval: u64,
}

impl StreamAdapter for SeqAdapter {
    type Message = u64;

    fn name(&self) -> &'static str {
        "seq"
    }

    fn subscription_id(&self) -> &str {
        SUBSCRIPTION
    }

    fn checkpoint_interval(&self) -> u64 {
        self.interval
    }

    fn resume_url(&self, cursor: Option<Cursor>) -> Result<String> {
        Ok(match cursor {
            Some(cursor) => format!("{}?cursor={}", SUBSCRIPTION, cursor),
            None => SUBSCRIPTION.to_string(),
        })
    }

    fn decode_frame(&self, frame: Frame) -> Result<Option<u64>> {
        match frame {
            Frame::Text(text) => text
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidFrame(text)),
            Frame::Binary(_) => Ok(None),
        }
    }

    fn cursor(&self, message: &u64) -> Cursor {
        Cursor(*message)
    }

    /// Odd sequence numbers carry one post delete, even ones nothing.
    fn classify(&self, message: &u64) -> OperationBatch {
        let mut batch = OperationBatch::new();
        if message % 2 == 1 {
            batch.push(TypedOperation::Delete(DeleteOp {
                kind: ContentKind::Post,
                uri: format!("at://did:plc:alice/app.bsky.feed.post/{}", message),
            }));
        }
        batch
    }
}

/// Serves one scripted session per `open` call. A session yields its frames
/// and then stays silent; with no script left, `open` fails.
#[derive(Default)]
struct ScriptedTransport {
    sessions: Mutex<VecDeque<Vec<Result<Frame>>>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(sessions: Vec<Vec<Result<Frame>>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            opened: Mutex::new(Vec::new()),
        }
    }

    fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn open<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FrameStream>> + Send + 'a>> {
        Box::pin(async move {
            self.opened.lock().push(url.to_string());
            let script = self
                .sessions
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Transport("connection refused".to_string()))?;
            let frames: FrameStream = Box::pin(stream::iter(script).chain(stream::pending()));
            Ok(frames)
        })
    }
}

fn frames(seqs: impl IntoIterator<Item = u64>) -> Vec<Result<Frame>> {
    seqs.into_iter()
        .map(|seq| Ok(Frame::Text(seq.to_string())))
        .collect()
}

#[derive(Default)]
struct RecordingHandler {
    batches: Mutex<Vec<OperationBatch>>,
}

impl RecordingHandler {
    fn handled(&self) -> usize {
        self.batches.lock().len()
    }
}

impl EventHandler for RecordingHandler {
    async fn initialize(&self, _store: Arc<Database>) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, batch: OperationBatch) -> Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }
}

struct FailingHandler;

impl EventHandler for FailingHandler {
    async fn initialize(&self, _store: Arc<Database>) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, _batch: OperationBatch) -> Result<()> {
        Err(Error::Handler("downstream unavailable".to_string()))
    }
}

struct FailingStore;

impl CheckpointStore for FailingStore {
    fn get_cursor(&self, _subscription_id: &str) -> Result<Option<Cursor>> {
        Err(Error::Database("disk full".to_string()))
    }

    fn set_cursor(&self, _subscription_id: &str, _cursor: Cursor) -> Result<()> {
        Err(Error::Database("disk full".to_string()))
    }
}

fn config() -> IngesterConfig {
    IngesterConfig {
        reconnect_delay: Duration::from_millis(10),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_checkpoints_every_interval_and_on_shutdown() {
    let transport = Arc::new(ScriptedTransport::new(vec![frames(1..=25)]));
    let store = Arc::new(MemoryCheckpointStore::new());
    let handler = Arc::new(RecordingHandler::default());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport.clone(),
        store.clone(),
        handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().messages == 25).await;
    assert_eq!(ingester.state(), IngestState::Streaming);
    assert_eq!(store.writes(), vec![(SUBSCRIPTION.to_string(), Cursor(20))]);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(ingester.state(), IngestState::Stopped);
    assert_eq!(
        store.writes().last(),
        Some(&(SUBSCRIPTION.to_string(), Cursor(25)))
    );
    assert_eq!(store.get_cursor(SUBSCRIPTION).unwrap(), Some(Cursor(25)));
    assert_eq!(handler.handled(), 25);
    assert_eq!(transport.opened(), vec![SUBSCRIPTION.to_string()]);
}

#[tokio::test]
async fn test_reconnect_resumes_from_persisted_cursor() {
    let mut first = frames(1..=15);
    first.push(Err(Error::Transport("connection reset".to_string())));
    let transport = Arc::new(ScriptedTransport::new(vec![first, Vec::new()]));
    let store = Arc::new(MemoryCheckpointStore::new());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport.clone(),
        store.clone(),
        Arc::new(RecordingHandler::default()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| transport.opened().len() == 2).await;

    // Nothing reached the checkpoint interval, so the new session starts
    // from the live head again.
    assert_eq!(
        transport.opened(),
        vec![SUBSCRIPTION.to_string(), SUBSCRIPTION.to_string()]
    );
    assert_eq!(ingester.stats().reconnects, 1);
    assert!(store.writes().is_empty());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stored_cursor_is_used_for_every_session() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        vec![Err(Error::StreamClosed)],
        Vec::new(),
    ]));
    let store = Arc::new(MemoryCheckpointStore::with_cursor(SUBSCRIPTION, Cursor(7)));
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport.clone(),
        store,
        Arc::new(RecordingHandler::default()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| transport.opened().len() == 2).await;
    assert_eq!(
        transport.opened(),
        vec![
            "test://seq?cursor=7".to_string(),
            "test://seq?cursor=7".to_string()
        ]
    );

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_is_skipped() {
    let script = vec![
        Ok(Frame::Text("1".to_string())),
        Ok(Frame::Text("bad".to_string())),
        Ok(Frame::Binary(vec![0xff])),
        Ok(Frame::Text("2".to_string())),
    ];
    let transport = Arc::new(ScriptedTransport::new(vec![script]));
    let handler = Arc::new(RecordingHandler::default());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().messages == 2).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    let stats = ingester.stats();
    assert_eq!(stats.invalid_messages, 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(transport.opened().len(), 1);
    assert_eq!(handler.handled(), 2);
}

#[tokio::test]
async fn test_handler_failures_do_not_stop_the_stream() {
    let transport = Arc::new(ScriptedTransport::new(vec![frames(1..=3)]));
    let store = Arc::new(MemoryCheckpointStore::new());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 2 },
        transport.clone(),
        store.clone(),
        Arc::new(FailingHandler),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().handler_errors == 3).await;
    assert_eq!(ingester.state(), IngestState::Streaming);
    assert_eq!(ingester.stats().reconnects, 0);
    assert_eq!(store.get_cursor(SUBSCRIPTION).unwrap(), Some(Cursor(2)));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_failures_do_not_stop_the_stream() {
    let transport = Arc::new(ScriptedTransport::new(vec![frames(1..=4)]));
    let handler = Arc::new(RecordingHandler::default());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 2 },
        transport.clone(),
        Arc::new(FailingStore),
        handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().messages == 4).await;
    let stats = ingester.stats();
    assert_eq!(stats.checkpoint_errors, 2);
    assert_eq!(stats.checkpoints_written, 0);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(transport.opened(), vec![SUBSCRIPTION.to_string()]);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(handler.handled(), 4);
}

#[tokio::test]
async fn test_empty_batches_are_dispatched() {
    let transport = Arc::new(ScriptedTransport::new(vec![frames([2, 4, 5])]));
    let handler = Arc::new(RecordingHandler::default());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport,
        Arc::new(MemoryCheckpointStore::new()),
        handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().messages == 3).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    let batches = handler.batches.lock();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches.iter().filter(|batch| batch.is_empty()).count(), 2);
}

#[tokio::test]
async fn test_shutdown_before_connect_stops_immediately() {
    let transport = Arc::new(ScriptedTransport::new(vec![frames(1..=3)]));
    let ingester = Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(RecordingHandler::default()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();
    ingester.run(shutdown_rx).await;

    assert_eq!(ingester.state(), IngestState::Stopped);
    assert!(transport.opened().is_empty());
}

/// Records the sequence number carried by each batch as the call starts.
#[derive(Default)]
struct OrderHandler {
    seen: Mutex<Vec<u64>>,
}

impl EventHandler for OrderHandler {
    async fn initialize(&self, _store: Arc<Database>) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, batch: OperationBatch) -> Result<()> {
        let seq = batch
            .posts
            .deletes
            .first()
            .and_then(|op| op.uri.rsplit('/').next())
            .and_then(|rkey| rkey.parse().ok())
            .unwrap_or_default();
        self.seen.lock().push(seq);
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_sees_batches_in_stream_order() {
    // Odd sequence numbers so every batch carries its position.
    let seqs: Vec<u64> = (0..2000).map(|i| 2 * i + 1).collect();
    let transport = Arc::new(ScriptedTransport::new(vec![frames(seqs.clone())]));
    let handler = Arc::new(OrderHandler::default());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 100 },
        transport,
        Arc::new(MemoryCheckpointStore::new()),
        handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| handler.seen.lock().len() == seqs.len()).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(*handler.seen.lock(), seqs);
}

struct PanickingHandler;

impl EventHandler for PanickingHandler {
    async fn initialize(&self, _store: Arc<Database>) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, _batch: OperationBatch) -> Result<()> {
        panic!("handler bug");
    }
}

#[tokio::test]
async fn test_handler_panics_are_counted() {
    let transport = Arc::new(ScriptedTransport::new(vec![frames(1..=2)]));
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(PanickingHandler),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().handler_errors == 2).await;
    assert_eq!(ingester.state(), IngestState::Streaming);
    assert_eq!(ingester.stats().reconnects, 0);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(ingester.state(), IngestState::Stopped);
}

#[tokio::test]
async fn test_batches_queued_before_a_reconnect_are_still_handled() {
    let mut first = frames(1..=5);
    first.push(Err(Error::StreamClosed));
    let transport = Arc::new(ScriptedTransport::new(vec![first, frames(6..=8)]));
    let handler = Arc::new(OrderHandler::default());
    let ingester = Arc::new(Ingester::new(
        config(),
        SeqAdapter { interval: 20 },
        transport,
        Arc::new(MemoryCheckpointStore::new()),
        handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let ingester = ingester.clone();
        async move { ingester.run(shutdown_rx).await }
    });

    wait_until(|| ingester.stats().messages == 8).await;
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    // Even sequence numbers carry empty batches and record as 0.
    assert_eq!(*handler.seen.lock(), vec![1, 0, 3, 0, 5, 0, 7, 0]);
}
