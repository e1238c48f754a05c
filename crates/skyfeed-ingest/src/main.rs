//! skyfeed ingestion daemon.
//!
//! Subscribes to the firehose and/or Jetstream, indexes matching posts into
//! SQLite, and applies manual overrides from operator files.
//!
//! # Usage
//!
//! ```bash
//! # Firehose only, default paths
//! skyfeed-ingest
//!
//! # Both sources, custom database
//! skyfeed-ingest --sources firehose,jetstream --db-path /data/skyfeed.db
//!
//! # Jetstream with extra collections
//! SKYFEED_SOURCES=jetstream \
//! SKYFEED_JETSTREAM_COLLECTIONS=app.bsky.feed.post,app.bsky.feed.like \
//!     skyfeed-ingest
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM:
//! 1. Stop pulling from every stream
//! 2. Wait for in-flight handler calls
//! 3. Persist each stream's latest cursor
//! 4. Exit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use skyfeed_core::DagCborCodec;
use skyfeed_core::metrics::{init_metrics, start_metrics_server};
use skyfeed_ingest::handler::{DEFAULT_EXCLUDE_PATTERN, DEFAULT_INCLUDE_PATTERN};
use skyfeed_ingest::{
    AppViewResolver, CheckpointStore, Database, EventHandler, FeedHandler, FirehoseAdapter,
    FirehoseConfig, Ingester, IngesterConfig, JetstreamAdapter, JetstreamConfig, ManualOverride,
    ManualOverrideConfig, PostFilter, Transport, WebSocketConfig, WebSocketTransport,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum SourceKind {
    Firehose,
    Jetstream,
}

/// skyfeed ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "skyfeed-ingest")]
#[command(about = "Resumable repository event ingestion for a topic feed")]
#[command(version)]
struct Args {
    /// SQLite database path
    #[arg(long, env = "SKYFEED_DB_PATH", default_value = "./data/skyfeed.db")]
    db_path: PathBuf,

    /// Streams to ingest (comma-separated)
    #[arg(
        long,
        env = "SKYFEED_SOURCES",
        value_enum,
        value_delimiter = ',',
        default_value = "firehose"
    )]
    sources: Vec<SourceKind>,

    /// Firehose relay service URL
    #[arg(long, env = "SKYFEED_FIREHOSE_SERVICE", default_value = "wss://bsky.network")]
    firehose_service: String,

    /// Jetstream service URL
    #[arg(
        long,
        env = "SKYFEED_JETSTREAM_SERVICE",
        default_value = "wss://jetstream2.us-east.bsky.network"
    )]
    jetstream_service: String,

    /// Collections requested from Jetstream (comma-separated)
    #[arg(
        long,
        env = "SKYFEED_JETSTREAM_COLLECTIONS",
        value_delimiter = ',',
        default_value = "app.bsky.feed.post"
    )]
    jetstream_collections: Vec<String>,

    /// Delay before reconnecting a failed stream (milliseconds)
    #[arg(long, env = "SKYFEED_RECONNECT_DELAY_MS", default_value = "3000")]
    reconnect_delay_ms: u64,

    /// Persist the firehose cursor every N commits
    #[arg(long, env = "SKYFEED_FIREHOSE_CHECKPOINT_INTERVAL", default_value = "20")]
    firehose_checkpoint_interval: u64,

    /// Persist the Jetstream cursor every N events
    #[arg(long, env = "SKYFEED_JETSTREAM_CHECKPOINT_INTERVAL", default_value = "100")]
    jetstream_checkpoint_interval: u64,

    /// File of post URLs to add to the feed
    #[arg(long, env = "SKYFEED_INSERT_FILE", default_value = "insertPosts.txt")]
    insert_file: PathBuf,

    /// File of post URLs to remove from the feed
    #[arg(long, env = "SKYFEED_DELETE_FILE", default_value = "deletePosts.txt")]
    delete_file: PathBuf,

    /// How often to check the override files (seconds)
    #[arg(long, env = "SKYFEED_OVERRIDE_INTERVAL_SECS", default_value = "60")]
    override_interval_secs: u64,

    /// AppView used to resolve handles and fetch posts
    #[arg(long, env = "SKYFEED_APPVIEW_URL", default_value = "https://public.api.bsky.app")]
    appview_url: String,

    /// Post text must match this pattern
    #[arg(long, env = "SKYFEED_INCLUDE_PATTERN", default_value = DEFAULT_INCLUDE_PATTERN)]
    include_pattern: String,

    /// Post text must not match this pattern
    #[arg(long, env = "SKYFEED_EXCLUDE_PATTERN", default_value = DEFAULT_EXCLUDE_PATTERN)]
    exclude_pattern: String,

    /// Prometheus metrics port (0 to disable)
    #[arg(long, env = "SKYFEED_METRICS_PORT", default_value = "9091")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Both the websocket client and the HTTP client use rustls.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("Failed to install rustls crypto provider");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("skyfeed_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    if args.sources.is_empty() {
        bail!("At least one source must be enabled");
    }

    tracing::info!("skyfeed ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let db = Arc::new(
        Database::open(&args.db_path)
            .with_context(|| format!("Failed to open database {}", args.db_path.display()))?,
    );

    let filter = PostFilter::new(&args.include_pattern, &args.exclude_pattern)
        .context("Invalid post filter")?;
    let handler = Arc::new(FeedHandler::new(filter));
    handler
        .initialize(db.clone())
        .await
        .context("Failed to initialize feed handler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to set Ctrl+C handler")?;

    let transport: Arc<dyn Transport> =
        Arc::new(WebSocketTransport::new(WebSocketConfig::default()));
    let checkpoints: Arc<dyn CheckpointStore> = db.clone();
    let ingester_config = IngesterConfig {
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
    };

    let mut sources = args.sources.clone();
    sources.sort_unstable();
    sources.dedup();

    let mut tasks = JoinSet::new();
    for source in sources {
        let shutdown = shutdown_rx.clone();
        match source {
            SourceKind::Firehose => {
                let adapter = FirehoseAdapter::new(
                    FirehoseConfig {
                        service: args.firehose_service.clone(),
                        checkpoint_interval: args.firehose_checkpoint_interval,
                    },
                    Arc::new(DagCborCodec::new()),
                );
                let ingester = Ingester::new(
                    ingester_config.clone(),
                    adapter,
                    transport.clone(),
                    checkpoints.clone(),
                    handler.clone(),
                );
                tasks.spawn(async move { ingester.run(shutdown).await });
            }
            SourceKind::Jetstream => {
                let adapter = JetstreamAdapter::new(JetstreamConfig {
                    service: args.jetstream_service.clone(),
                    wanted_collections: args.jetstream_collections.clone(),
                    checkpoint_interval: args.jetstream_checkpoint_interval,
                });
                let ingester = Ingester::new(
                    ingester_config.clone(),
                    adapter,
                    transport.clone(),
                    checkpoints.clone(),
                    handler.clone(),
                );
                tasks.spawn(async move { ingester.run(shutdown).await });
            }
        }
    }

    let resolver = Arc::new(
        AppViewResolver::new(args.appview_url.clone()).context("Failed to build HTTP client")?,
    );
    let manual = ManualOverride::new(
        ManualOverrideConfig {
            insert_path: args.insert_file.clone(),
            delete_path: args.delete_file.clone(),
            interval: Duration::from_secs(args.override_interval_secs),
        },
        resolver,
        handler.clone(),
    )
    .context("Failed to build manual override poller")?;
    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move { manual.run(shutdown).await });

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("Task failed: {}", e);
        }
    }

    for checkpoint in db.get_checkpoints()? {
        tracing::info!(
            "Final checkpoint {}: cursor {}",
            checkpoint.service,
            checkpoint.cursor
        );
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
