//! Typed repository operations grouped by content kind.
//!
//! Classification turns one upstream commit into an [`OperationBatch`]: four
//! buckets (posts, reposts, likes, follows), each split into creates and
//! deletes. Buckets keep the order in which operations appeared in the commit.

use serde::{Deserialize, Serialize};

use crate::{FOLLOW_COLLECTION, LIKE_COLLECTION, POST_COLLECTION, REPOST_COLLECTION};

/// Content category of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Post,
    Repost,
    Like,
    Follow,
}

impl ContentKind {
    /// All recognized kinds, in bucket order.
    pub const ALL: [ContentKind; 4] = [Self::Post, Self::Repost, Self::Like, Self::Follow];

    /// The collection NSID records of this kind live under.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Post => POST_COLLECTION,
            Self::Repost => REPOST_COLLECTION,
            Self::Like => LIKE_COLLECTION,
            Self::Follow => FOLLOW_COLLECTION,
        }
    }

    /// Look up a kind by collection NSID.
    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection() == collection)
    }

    /// Derive the kind from a record path (`<collection>/<rkey>`).
    pub fn from_path(path: &str) -> Option<Self> {
        let collection = path.split('/').next()?;
        Self::from_collection(collection)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Repost => "repost",
            Self::Like => "like",
            Self::Follow => "follow",
        }
    }
}

/// Action applied to a record in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

/// Build the stable address of a record: `at://<repo>/<path>`.
pub fn at_uri(repo: &str, path: &str) -> String {
    format!("at://{repo}/{path}")
}

/// A created record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOp {
    pub kind: ContentKind,
    pub uri: String,
    /// Content identifier of the record block.
    pub cid: String,
    /// RFC 3339 timestamp the record was indexed at.
    pub indexed_at: String,
    /// Post body. Only set for posts.
    pub text: Option<String>,
}

/// A deleted record. Deletes carry only the record address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOp {
    pub kind: ContentKind,
    pub uri: String,
}

/// One classified operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedOperation {
    Create(CreateOp),
    Delete(DeleteOp),
}

impl TypedOperation {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Create(op) => op.kind,
            Self::Delete(op) => op.kind,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Self::Create(_) => Action::Create,
            Self::Delete(_) => Action::Delete,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::Create(op) => &op.uri,
            Self::Delete(op) => &op.uri,
        }
    }
}

/// Creates and deletes for a single content kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBucket {
    pub creates: Vec<CreateOp>,
    pub deletes: Vec<DeleteOp>,
}

impl OperationBucket {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.deletes.len()
    }
}

/// Operations from one commit, grouped by kind.
///
/// An empty batch is valid and is still handed to the event handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub posts: OperationBucket,
    pub reposts: OperationBucket,
    pub likes: OperationBucket,
    pub follows: OperationBucket,
}

impl OperationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, kind: ContentKind) -> &OperationBucket {
        match kind {
            ContentKind::Post => &self.posts,
            ContentKind::Repost => &self.reposts,
            ContentKind::Like => &self.likes,
            ContentKind::Follow => &self.follows,
        }
    }

    pub fn bucket_mut(&mut self, kind: ContentKind) -> &mut OperationBucket {
        match kind {
            ContentKind::Post => &mut self.posts,
            ContentKind::Repost => &mut self.reposts,
            ContentKind::Like => &mut self.likes,
            ContentKind::Follow => &mut self.follows,
        }
    }

    /// Append an operation to the bucket matching its kind and action.
    pub fn push(&mut self, op: TypedOperation) {
        let bucket = self.bucket_mut(op.kind());
        match op {
            TypedOperation::Create(create) => bucket.creates.push(create),
            TypedOperation::Delete(delete) => bucket.deletes.push(delete),
        }
    }

    pub fn is_empty(&self) -> bool {
        ContentKind::ALL
            .iter()
            .all(|kind| self.bucket(*kind).is_empty())
    }

    /// Total number of operations across all buckets.
    pub fn len(&self) -> usize {
        ContentKind::ALL
            .iter()
            .map(|kind| self.bucket(*kind).len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn create(kind: ContentKind, rkey: &str) -> TypedOperation {
        TypedOperation::Create(CreateOp {
            kind,
            uri: at_uri("did:plc:alice", &format!("{}/{rkey}", kind.collection())),
            cid: format!("bafy{rkey}"),
            indexed_at: "2024-01-01T00:00:00.000Z".to_string(),
            text: (kind == ContentKind::Post).then(|| "hello".to_string()),
        })
    }

    #[test]
    fn test_kind_from_path() {
        assert_eq!(
            ContentKind::from_path("app.bsky.feed.post/3k2a"),
            Some(ContentKind::Post)
        );
        assert_eq!(
            ContentKind::from_path("app.bsky.graph.follow/3k2a"),
            Some(ContentKind::Follow)
        );
        assert_eq!(ContentKind::from_path("app.bsky.actor.profile/self"), None);
        assert_eq!(ContentKind::from_path(""), None);
    }

    #[test]
    fn test_kind_collection_roundtrip() {
        for kind in ContentKind::ALL {
            assert_eq!(ContentKind::from_collection(kind.collection()), Some(kind));
        }
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(Action::from_str("create"), Ok(Action::Create));
        assert_eq!(Action::from_str("update"), Ok(Action::Update));
        assert_eq!(Action::from_str("delete"), Ok(Action::Delete));
        assert_eq!(Action::from_str("upsert"), Err(()));
    }

    #[test]
    fn test_at_uri() {
        assert_eq!(
            at_uri("did:plc:alice", "app.bsky.feed.like/3k2a"),
            "at://did:plc:alice/app.bsky.feed.like/3k2a"
        );
    }

    #[test]
    fn test_push_routes_to_buckets_in_order() {
        let mut batch = OperationBatch::new();
        batch.push(create(ContentKind::Post, "a"));
        batch.push(create(ContentKind::Like, "b"));
        batch.push(create(ContentKind::Post, "c"));
        batch.push(TypedOperation::Delete(DeleteOp {
            kind: ContentKind::Follow,
            uri: "at://did:plc:alice/app.bsky.graph.follow/d".to_string(),
        }));

        assert_eq!(batch.len(), 4);
        let posts: Vec<_> = batch.posts.creates.iter().map(|c| c.cid.as_str()).collect();
        assert_eq!(posts, vec!["bafya", "bafyc"]);
        assert_eq!(batch.likes.creates.len(), 1);
        assert_eq!(batch.follows.deletes.len(), 1);
        assert!(batch.reposts.is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let batch = OperationBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
    }

    #[test]
    fn test_typed_operation_accessors() {
        let op = create(ContentKind::Repost, "x");
        assert_eq!(op.kind(), ContentKind::Repost);
        assert_eq!(op.action(), Action::Create);
        assert!(op.uri().ends_with("app.bsky.feed.repost/x"));
    }
}
