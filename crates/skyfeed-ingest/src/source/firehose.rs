//! Full-commit adapter for `com.atproto.sync.subscribeRepos`.
//!
//! Each binary frame is two concatenated DAG-CBOR values: a header
//! `{op, t}` and a body. `op = 1, t = "#commit"` carries a repository commit
//! with its records attached as a CAR archive; other message types are
//! skipped. `op = -1` is an error frame and ends the session.

use std::sync::Arc;

use chrono::Utc;
use ciborium::Value;
use skyfeed_core::codec::{map_get, text_field};
use skyfeed_core::{BlockMap, Cid, OperationBatch, RecordCodec};

use super::params::{ParamValue, encode_query_params};
use super::{Frame, StreamAdapter};
use crate::checkpoint::Cursor;
use crate::classify::classify_commit;
use crate::{Error, Result};

const SUBSCRIBE_REPOS_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

/// Configuration for the firehose adapter.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Relay service URL (`wss://...`). Also the checkpoint key.
    pub service: String,

    /// Persist the cursor every this many commits.
    pub checkpoint_interval: u64,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            service: "wss://bsky.network".to_string(),
            checkpoint_interval: 20,
        }
    }
}

/// One operation inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// `create`, `update` or `delete`.
    pub action: String,
    /// `<collection>/<rkey>`.
    pub path: String,
    /// Record block reference. Absent for deletes.
    pub cid: Option<Cid>,
}

/// A decoded `#commit` message.
#[derive(Debug, Clone)]
pub struct Commit {
    pub seq: u64,
    pub repo: String,
    pub ops: Vec<RepoOp>,
    pub blocks: BlockMap,
}

/// Adapter for the full-commit firehose.
pub struct FirehoseAdapter {
    config: FirehoseConfig,
    codec: Arc<dyn RecordCodec>,
}

impl FirehoseAdapter {
    pub fn new(config: FirehoseConfig, codec: Arc<dyn RecordCodec>) -> Self {
        Self { config, codec }
    }
}

impl StreamAdapter for FirehoseAdapter {
    type Message = Commit;

    fn name(&self) -> &'static str {
        "firehose"
    }

    fn subscription_id(&self) -> &str {
        &self.config.service
    }

    fn checkpoint_interval(&self) -> u64 {
        self.config.checkpoint_interval
    }

    fn resume_url(&self, cursor: Option<Cursor>) -> Result<String> {
        let base = format!(
            "{}{}",
            self.config.service.trim_end_matches('/'),
            SUBSCRIBE_REPOS_PATH
        );
        let query = encode_query_params(&[("cursor", ParamValue::from(cursor.map(|c| c.value())))]);
        if query.is_empty() {
            Ok(base)
        } else {
            Ok(format!("{base}?{query}"))
        }
    }

    fn decode_frame(&self, frame: Frame) -> Result<Option<Commit>> {
        match frame {
            Frame::Binary(bytes) => decode_message(&bytes),
            Frame::Text(_) => Err(Error::InvalidFrame(
                "unexpected text frame on firehose".to_string(),
            )),
        }
    }

    fn cursor(&self, commit: &Commit) -> Cursor {
        Cursor(commit.seq)
    }

    fn classify(&self, commit: &Commit) -> OperationBatch {
        classify_commit(commit, self.codec.as_ref(), Utc::now())
    }
}

/// Decode one firehose frame.
pub fn decode_message(bytes: &[u8]) -> Result<Option<Commit>> {
    let mut rest = bytes;
    let header: Value = ciborium::from_reader(&mut rest)
        .map_err(|e| Error::InvalidFrame(format!("header: {}", e)))?;

    let op = match map_get(&header, "op") {
        Some(Value::Integer(op)) => i128::from(*op),
        _ => return Err(Error::InvalidFrame("header missing op".to_string())),
    };

    let body: Value = ciborium::from_reader(&mut rest)
        .map_err(|e| Error::InvalidFrame(format!("body: {}", e)))?;

    match op {
        -1 => Err(Error::UpstreamError {
            error: text_field(&body, "error").unwrap_or("Unknown").to_string(),
            message: text_field(&body, "message").unwrap_or_default().to_string(),
        }),
        1 => match text_field(&header, "t") {
            Some("#commit") => decode_commit(&body).map(Some),
            Some(t) => {
                tracing::trace!("Skipping firehose message type {}", t);
                Ok(None)
            }
            None => Err(Error::InvalidFrame("header missing t".to_string())),
        },
        other => Err(Error::InvalidFrame(format!("unknown op {}", other))),
    }
}

fn decode_commit(body: &Value) -> Result<Commit> {
    let seq = match map_get(body, "seq") {
        Some(Value::Integer(seq)) => u64::try_from(i128::from(*seq))
            .map_err(|_| Error::InvalidFrame("negative seq".to_string()))?,
        _ => return Err(Error::InvalidFrame("commit missing seq".to_string())),
    };

    let repo = text_field(body, "repo")
        .ok_or_else(|| Error::InvalidFrame("commit missing repo".to_string()))?
        .to_string();

    let ops = match map_get(body, "ops") {
        Some(Value::Array(ops)) => ops.iter().map(decode_op).collect::<Result<Vec<_>>>()?,
        _ => return Err(Error::InvalidFrame("commit missing ops".to_string())),
    };

    let blocks = match map_get(body, "blocks") {
        Some(Value::Bytes(car)) if !car.is_empty() => BlockMap::from_car(car)?,
        Some(Value::Bytes(_)) => BlockMap::new(),
        _ => return Err(Error::InvalidFrame("commit missing blocks".to_string())),
    };

    Ok(Commit {
        seq,
        repo,
        ops,
        blocks,
    })
}

fn decode_op(value: &Value) -> Result<RepoOp> {
    let action = text_field(value, "action")
        .ok_or_else(|| Error::InvalidFrame("op missing action".to_string()))?;
    let path = text_field(value, "path")
        .ok_or_else(|| Error::InvalidFrame("op missing path".to_string()))?;
    let cid = match map_get(value, "cid") {
        None | Some(Value::Null) => None,
        Some(link) => Some(Cid::from_link(link)?),
    };

    Ok(RepoOp {
        action: action.to_string(),
        path: path.to_string(),
        cid,
    })
}
