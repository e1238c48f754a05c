//! Simplified-event adapter for Jetstream.
//!
//! Jetstream flattens each repository operation into one JSON event keyed by
//! a microsecond timestamp (`time_us`), which doubles as the cursor.

use serde::Deserialize;
use skyfeed_core::{OperationBatch, POST_COLLECTION};

use super::params::{ParamValue, encode_query_params};
use super::{Frame, StreamAdapter};
use crate::checkpoint::Cursor;
use crate::classify::classify_jetstream;
use crate::{Error, Result};

/// Configuration for the Jetstream adapter.
#[derive(Debug, Clone)]
pub struct JetstreamConfig {
    /// Jetstream service URL (`wss://...`). Also the checkpoint key.
    pub service: String,

    /// Collections to subscribe to.
    pub wanted_collections: Vec<String>,

    /// Persist the cursor every this many events.
    pub checkpoint_interval: u64,
}

impl Default for JetstreamConfig {
    fn default() -> Self {
        Self {
            service: "wss://jetstream2.us-east.bsky.network".to_string(),
            wanted_collections: vec![POST_COLLECTION.to_string()],
            checkpoint_interval: 100,
        }
    }
}

/// One Jetstream event.
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: u64,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<JetstreamCommit>,
}

/// The operation carried by a `commit` event.
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamCommit {
    #[serde(default)]
    pub rev: String,
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<JetstreamRecord>,
    #[serde(default)]
    pub cid: Option<String>,
}

/// The fields of a record this pipeline reads.
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamRecord {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<String>,
}

/// Adapter for Jetstream.
pub struct JetstreamAdapter {
    config: JetstreamConfig,
}

impl JetstreamAdapter {
    pub fn new(config: JetstreamConfig) -> Self {
        Self { config }
    }
}

impl StreamAdapter for JetstreamAdapter {
    type Message = JetstreamEvent;

    fn name(&self) -> &'static str {
        "jetstream"
    }

    fn subscription_id(&self) -> &str {
        &self.config.service
    }

    fn checkpoint_interval(&self) -> u64 {
        self.config.checkpoint_interval
    }

    fn resume_url(&self, cursor: Option<Cursor>) -> Result<String> {
        let query = encode_query_params(&[
            ("cursor", ParamValue::from(cursor.map(|c| c.value()))),
            (
                "wantedCollections",
                ParamValue::from(self.config.wanted_collections.clone()),
            ),
        ]);
        let base = format!("{}/subscribe", self.config.service.trim_end_matches('/'));
        if query.is_empty() {
            Ok(base)
        } else {
            Ok(format!("{base}?{query}"))
        }
    }

    fn decode_frame(&self, frame: Frame) -> Result<Option<JetstreamEvent>> {
        let event: JetstreamEvent = match frame {
            Frame::Text(text) => serde_json::from_str(&text)?,
            Frame::Binary(bytes) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| Error::InvalidFrame(format!("binary frame is not UTF-8: {}", e)))?;
                serde_json::from_str(text)?
            }
        };

        if event.kind != "commit" {
            return Ok(None);
        }
        if event.commit.is_none() {
            return Err(Error::InvalidFrame(
                "commit event without commit body".to_string(),
            ));
        }
        Ok(Some(event))
    }

    fn cursor(&self, event: &JetstreamEvent) -> Cursor {
        Cursor(event.time_us)
    }

    fn classify(&self, event: &JetstreamEvent) -> OperationBatch {
        classify_jetstream(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST_EVENT: &str = r##"{
        "did": "did:plc:alice",
        "time_us": 1725911162329308,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vutsw2b",
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": "3l3qo2vuowo2b",
            "record": {
                "$type": "app.bsky.feed.post",
                "createdAt": "2024-09-09T19:46:02.102Z",
                "langs": ["en"],
                "text": "#survivor tonight"
            },
            "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
        }
    }"##;

    #[test]
    fn test_resume_url() {
        let adapter = JetstreamAdapter::new(JetstreamConfig::default());
        assert_eq!(
            adapter.resume_url(None).unwrap(),
            "wss://jetstream2.us-east.bsky.network/subscribe?wantedCollections=app.bsky.feed.post"
        );
        assert_eq!(
            adapter
                .resume_url(Some(Cursor(1725911162329308)))
                .unwrap(),
            "wss://jetstream2.us-east.bsky.network/subscribe?cursor=1725911162329308&wantedCollections=app.bsky.feed.post"
        );
        assert_eq!(adapter.checkpoint_interval(), 100);
    }

    #[test]
    fn test_resume_url_repeats_collections() {
        let adapter = JetstreamAdapter::new(JetstreamConfig {
            service: "wss://jetstream.example/".to_string(),
            wanted_collections: vec![
                "app.bsky.feed.post".to_string(),
                "app.bsky.feed.like".to_string(),
            ],
            checkpoint_interval: 100,
        });
        assert_eq!(
            adapter.resume_url(None).unwrap(),
            "wss://jetstream.example/subscribe?wantedCollections=app.bsky.feed.post&wantedCollections=app.bsky.feed.like"
        );
    }

    #[test]
    fn test_decode_commit_event() {
        let adapter = JetstreamAdapter::new(JetstreamConfig::default());
        let event = adapter
            .decode_frame(Frame::Text(POST_EVENT.to_string()))
            .unwrap()
            .unwrap();

        assert_eq!(event.did, "did:plc:alice");
        assert_eq!(adapter.cursor(&event), Cursor(1725911162329308));
        let commit = event.commit.as_ref().unwrap();
        assert_eq!(commit.operation, "create");
        assert_eq!(
            commit.record.as_ref().unwrap().text.as_deref(),
            Some("#survivor tonight")
        );
    }

    #[test]
    fn test_binary_frames_are_json() {
        let adapter = JetstreamAdapter::new(JetstreamConfig::default());
        let event = adapter
            .decode_frame(Frame::Binary(POST_EVENT.as_bytes().to_vec()))
            .unwrap();
        assert!(event.is_some());
    }

    #[test]
    fn test_non_commit_events_are_skipped() {
        let adapter = JetstreamAdapter::new(JetstreamConfig::default());
        let identity = r#"{"did":"did:plc:alice","time_us":1725516665333808,"kind":"identity","identity":{"did":"did:plc:alice","handle":"alice.example","seq":1,"time":"2024-09-05T06:11:04.870Z"}}"#;
        assert!(
            adapter
                .decode_frame(Frame::Text(identity.to_string()))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_malformed_json_is_message_error() {
        let adapter = JetstreamAdapter::new(JetstreamConfig::default());
        let err = adapter
            .decode_frame(Frame::Text("{not json".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert!(!err.is_transport());
    }
}
