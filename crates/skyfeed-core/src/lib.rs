//! Core types, record decoding, and shared utilities for the skyfeed ingestion pipeline.
//!
//! This crate provides:
//! - Typed create/delete operations grouped by content kind ([`OperationBatch`])
//! - The record codec used to read commit blocks (CAR + DAG-CBOR) and validate records
//! - Prometheus metrics helpers
//! - Shared error types

pub mod codec;
mod error;
pub mod metrics;
mod ops;

// ═══════════════════════════════════════════════════════════════════════════
// Collections
// ═══════════════════════════════════════════════════════════════════════════

/// Collection NSID for posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Collection NSID for reposts.
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

/// Collection NSID for likes.
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";

/// Collection NSID for follows.
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

pub use codec::{BlockMap, Cid, DagCborCodec, Record, RecordCodec};
pub use error::{Error, Result};
pub use ops::{
    Action, ContentKind, CreateOp, DeleteOp, OperationBatch, OperationBucket, TypedOperation,
    at_uri,
};
