//! Manual feed overrides.
//!
//! Operators append `https://bsky.app/profile/<handle>/post/<rkey>` URLs to
//! an insert file or a delete file. A [`ManualOverride`] poller reads both
//! files on its own interval, empties them, resolves each URL to a post and
//! feeds the result through the same [`EventHandler`] as the streams.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use regex::Regex;
use serde::Deserialize;
use skyfeed_core::{
    ContentKind, CreateOp, DeleteOp, OperationBatch, POST_COLLECTION, TypedOperation, at_uri,
};
use tokio::sync::watch;

use crate::handler::EventHandler;
use crate::ingester::wait_for_shutdown;
use crate::{Error, Result};

const POST_URL_PATTERN: &str = r"^https://bsky\.app/profile/([^/]+)/post/([^/?#]+)";

/// Configuration for the manual override poller.
#[derive(Debug, Clone)]
pub struct ManualOverrideConfig {
    /// File of post URLs to add to the feed.
    pub insert_path: PathBuf,

    /// File of post URLs to remove from the feed.
    pub delete_path: PathBuf,

    /// How often to check both files.
    pub interval: Duration,
}

impl Default for ManualOverrideConfig {
    fn default() -> Self {
        Self {
            insert_path: PathBuf::from("insertPosts.txt"),
            delete_path: PathBuf::from("deletePosts.txt"),
            interval: Duration::from_secs(60),
        }
    }
}

/// Looks up identities and posts.
pub trait PostResolver: Send + Sync + 'static {
    /// Resolve a handle to a DID.
    fn resolve_handle(&self, handle: &str) -> impl Future<Output = Result<String>> + Send;

    /// Fetch a post by AT URI as a create operation.
    fn fetch_post(&self, uri: &str) -> impl Future<Output = Result<CreateOp>> + Send;
}

/// [`PostResolver`] backed by an AppView's XRPC endpoints.
#[derive(Debug, Clone)]
pub struct AppViewResolver {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Deserialize)]
struct PostThreadResponse {
    thread: ThreadView,
}

#[derive(Debug, Deserialize)]
struct ThreadView {
    post: PostView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    cid: String,
    indexed_at: String,
    record: PostViewRecord,
}

#[derive(Debug, Deserialize)]
struct PostViewRecord {
    #[serde(default)]
    text: String,
}

impl AppViewResolver {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl PostResolver for AppViewResolver {
    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let response: ResolveHandleResponse = self
            .client
            .get(format!(
                "{}/xrpc/com.atproto.identity.resolveHandle",
                self.base_url
            ))
            .query(&[("handle", handle)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.did)
    }

    async fn fetch_post(&self, uri: &str) -> Result<CreateOp> {
        let response: PostThreadResponse = self
            .client
            .get(format!("{}/xrpc/app.bsky.feed.getPostThread", self.base_url))
            .query(&[("uri", uri), ("depth", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let post = response.thread.post;
        tracing::debug!("Fetched {} with cid {}", uri, post.cid);
        Ok(CreateOp {
            kind: ContentKind::Post,
            uri: uri.to_string(),
            cid: post.cid,
            indexed_at: post.indexed_at,
            text: Some(post.record.text),
        })
    }
}

/// Matches `https://bsky.app/profile/<actor>/post/<rkey>` URLs.
#[derive(Debug, Clone)]
pub struct PostUrlParser {
    pattern: Regex,
}

impl PostUrlParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(POST_URL_PATTERN)
            .map_err(|e| Error::Config(format!("post URL pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    /// Split a post URL into its actor (handle or DID) and record key.
    pub fn parse(&self, url: &str) -> Result<(String, String)> {
        let url = url.trim();
        let captures = self
            .pattern
            .captures(url)
            .ok_or_else(|| Error::InvalidPostUrl(url.to_string()))?;
        Ok((captures[1].to_string(), captures[2].to_string()))
    }
}

/// Read the non-blank lines of `path`, then empty the file.
///
/// A missing file yields no lines. If the file cannot be emptied the lines
/// are still returned and will be read again on the next poll.
pub async fn take_lines(path: &Path) -> Result<Vec<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    // TODO: lines appended between the read and this truncate are lost; rename the file before reading instead.
    if let Err(e) = tokio::fs::write(path, "").await {
        tracing::warn!("Failed to empty {}: {}", path.display(), e);
    }

    Ok(lines)
}

/// File-driven override poller.
pub struct ManualOverride<R: PostResolver, H: EventHandler> {
    config: ManualOverrideConfig,
    urls: PostUrlParser,
    resolver: Arc<R>,
    handler: Arc<H>,
}

impl<R: PostResolver, H: EventHandler> ManualOverride<R, H> {
    pub fn new(config: ManualOverrideConfig, resolver: Arc<R>, handler: Arc<H>) -> Result<Self> {
        Ok(Self {
            config,
            urls: PostUrlParser::new()?,
            resolver,
            handler,
        })
    }

    /// Turn a post URL into an AT URI.
    pub async fn resolve_uri(&self, url: &str) -> Result<String> {
        let (actor, rkey) = self.urls.parse(url)?;
        let did = if actor.starts_with("did:") {
            actor
        } else {
            self.resolver.resolve_handle(&actor).await?
        };
        Ok(at_uri(&did, &format!("{}/{}", POST_COLLECTION, rkey)))
    }

    /// Process both files once. Returns the number of operations applied.
    ///
    /// Both files are read before anything is resolved, so a file that
    /// cannot be read never costs the lines already taken from the other.
    pub async fn poll_once(&self) -> Result<usize> {
        let delete_lines = self.take_file(&self.config.delete_path).await;
        let insert_lines = self.take_file(&self.config.insert_path).await;

        let mut ops = Vec::new();
        for line in delete_lines {
            match self.resolve_uri(&line).await {
                Ok(uri) => ops.push(TypedOperation::Delete(DeleteOp {
                    kind: ContentKind::Post,
                    uri,
                })),
                Err(e) => tracing::warn!("Skipping delete line '{}': {}", line, e),
            }
        }

        for line in insert_lines {
            let post = match self.resolve_uri(&line).await {
                Ok(uri) => self.resolver.fetch_post(&uri).await,
                Err(e) => Err(e),
            };
            match post {
                Ok(create) => ops.push(TypedOperation::Create(create)),
                Err(e) => tracing::warn!("Skipping insert line '{}': {}", line, e),
            }
        }

        let mut batch = OperationBatch::new();
        for op in ops {
            tracing::info!(
                "Manual {} of {} {}",
                op.action().as_str(),
                op.kind().as_str(),
                op.uri()
            );
            batch.push(op);
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let inserts = batch.posts.creates.len() as u64;
        let deletes = batch.posts.deletes.len() as u64;
        let applied = batch.len();
        self.handler.handle(batch).await?;

        counter!("manual_override_uris_total", "action" => "insert").increment(inserts);
        counter!("manual_override_uris_total", "action" => "delete").increment(deletes);

        Ok(applied)
    }

    async fn take_file(&self, path: &Path) -> Vec<String> {
        match take_lines(path).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::error!("Failed to read {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    /// Poll on the configured interval until `shutdown` becomes `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Watching {} and {} every {:?}",
            self.config.insert_path.display(),
            self.config.delete_path.display(),
            self.config.interval
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            if let Err(e) = self.poll_once().await {
                tracing::error!("Manual override poll failed: {}", e);
            }
        }
    }
}
