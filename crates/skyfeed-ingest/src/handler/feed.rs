//! Topic feed handler.
//!
//! Indexes post creates that pass the [`PostFilter`] and removes deleted
//! posts. Reposts, likes and follows are ignored.

use std::sync::{Arc, OnceLock};

use metrics::counter;
use skyfeed_core::OperationBatch;

use super::{EventHandler, PostFilter};
use crate::store::{Database, PostRow};
use crate::{Error, Result};

pub struct FeedHandler {
    filter: PostFilter,
    store: OnceLock<Arc<Database>>,
}

impl FeedHandler {
    pub fn new(filter: PostFilter) -> Self {
        Self {
            filter,
            store: OnceLock::new(),
        }
    }

    fn store(&self) -> Result<Arc<Database>> {
        self.store
            .get()
            .cloned()
            .ok_or_else(|| Error::Handler("feed handler used before initialize".to_string()))
    }
}

impl EventHandler for FeedHandler {
    async fn initialize(&self, store: Arc<Database>) -> Result<()> {
        self.store
            .set(store)
            .map_err(|_| Error::Handler("feed handler initialized twice".to_string()))
    }

    async fn handle(&self, batch: OperationBatch) -> Result<()> {
        let store = self.store()?;

        let deletes: Vec<String> = batch.posts.deletes.into_iter().map(|op| op.uri).collect();
        let creates: Vec<PostRow> = batch
            .posts
            .creates
            .into_iter()
            .filter(|op| self.filter.matches(op.text.as_deref().unwrap_or_default()))
            .map(|op| PostRow {
                uri: op.uri,
                cid: op.cid,
                indexed_at: op.indexed_at,
            })
            .collect();

        if deletes.is_empty() && creates.is_empty() {
            return Ok(());
        }

        for post in &creates {
            tracing::info!("Indexing post {}", post.uri);
        }

        let (deleted, inserted) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
            let deleted = store.delete_posts(&deletes)?;
            let inserted = store.insert_posts(&creates)?;
            Ok((deleted, inserted))
        })
        .await
        .map_err(|e| Error::Handler(format!("feed write task failed: {}", e)))??;

        counter!("feed_posts_deleted_total").increment(deleted as u64);
        counter!("feed_posts_indexed_total").increment(inserted as u64);

        Ok(())
    }
}
