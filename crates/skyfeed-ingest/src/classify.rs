//! Operation classification.
//!
//! Turns one upstream message into an [`OperationBatch`]. A problem with a
//! single operation (unknown collection, missing block, invalid record)
//! skips only that operation; the rest of the commit is still classified.

use chrono::{DateTime, SecondsFormat, Utc};
use skyfeed_core::codec::text_field;
use skyfeed_core::{
    Action, ContentKind, CreateOp, DeleteOp, OperationBatch, RecordCodec, TypedOperation, at_uri,
};

use crate::source::{Commit, JetstreamEvent};

/// Classify a full repository commit.
///
/// Creates are stamped with `indexed_at`. Updates are not supported and
/// produce no operation.
pub fn classify_commit(
    commit: &Commit,
    codec: &dyn RecordCodec,
    indexed_at: DateTime<Utc>,
) -> OperationBatch {
    let indexed_at = indexed_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut batch = OperationBatch::new();

    for op in &commit.ops {
        let uri = at_uri(&commit.repo, &op.path);

        let Some(kind) = ContentKind::from_path(&op.path) else {
            continue;
        };

        let action = match op.action.parse::<Action>() {
            Ok(action) => action,
            Err(()) => {
                tracing::debug!("Skipping op with unknown action '{}': {}", op.action, uri);
                continue;
            }
        };

        match action {
            Action::Update => continue,
            Action::Delete => batch.push(TypedOperation::Delete(DeleteOp { kind, uri })),
            Action::Create => {
                let Some(cid) = &op.cid else {
                    tracing::debug!("Skipping create without cid: {}", uri);
                    continue;
                };

                let record = match codec.decode_block(&commit.blocks, cid) {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        tracing::debug!("Skipping create with missing block {}: {}", cid, uri);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to decode record {}: {}", uri, e);
                        continue;
                    }
                };

                if !codec.validate_record(kind, &record) {
                    tracing::debug!("Skipping invalid {} record: {}", kind.as_str(), uri);
                    continue;
                }

                let text = match kind {
                    ContentKind::Post => text_field(&record, "text").map(str::to_string),
                    _ => None,
                };

                batch.push(TypedOperation::Create(CreateOp {
                    kind,
                    uri,
                    cid: cid.to_string(),
                    indexed_at: indexed_at.clone(),
                    text,
                }));
            }
        }
    }

    batch
}

/// Classify a Jetstream event.
///
/// Only post creates are recognized. The record's own `createdAt` is the
/// indexed timestamp.
pub fn classify_jetstream(event: &JetstreamEvent) -> OperationBatch {
    let mut batch = OperationBatch::new();

    let Some(commit) = &event.commit else {
        return batch;
    };
    if ContentKind::from_collection(&commit.collection) != Some(ContentKind::Post)
        || commit.operation != Action::Create.as_str()
    {
        return batch;
    }

    let uri = at_uri(&event.did, &format!("{}/{}", commit.collection, commit.rkey));
    let (Some(cid), Some(record)) = (&commit.cid, &commit.record) else {
        tracing::debug!("Skipping post create without cid or record: {}", uri);
        return batch;
    };
    let Some(created_at) = &record.created_at else {
        tracing::debug!("Skipping post without createdAt: {}", uri);
        return batch;
    };

    batch.push(TypedOperation::Create(CreateOp {
        kind: ContentKind::Post,
        uri,
        cid: cid.clone(),
        indexed_at: created_at.clone(),
        text: Some(record.text.clone().unwrap_or_default()),
    }));

    batch
}
