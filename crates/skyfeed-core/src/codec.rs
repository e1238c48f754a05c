//! Commit block decoding.
//!
//! Firehose commits carry their records as a CAR v1 archive: a varint-prefixed
//! DAG-CBOR header followed by `(varint length, CID, block bytes)` sections.
//! [`BlockMap`] indexes those sections by CID, and a [`RecordCodec`] decodes
//! and validates the record behind a repository operation.

use std::collections::HashMap;
use std::fmt;

use ciborium::Value;

use crate::{ContentKind, Error, Result};

/// CBOR tag for IPLD links.
const CID_LINK_TAG: u64 = 42;

/// Multihash code for sha2-256.
const SHA2_256: u64 = 0x12;

/// Multicodec for dag-pb, implied by CIDv0.
const DAG_PB: u64 = 0x70;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A decoded record: a raw DAG-CBOR value.
pub type Record = Value;

/// Read an unsigned LEB128 varint, returning the value and bytes consumed.
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::InvalidCar("unterminated varint".to_string()))
}

/// Content identifier in its binary form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Cid(Vec<u8>);

impl Cid {
    /// Parse a CID that occupies exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (cid, len) = Self::read_prefix(bytes)?;
        if len != bytes.len() {
            return Err(Error::InvalidCid(format!(
                "{} trailing bytes",
                bytes.len() - len
            )));
        }
        Ok(cid)
    }

    /// Parse a CID from the front of `bytes`, returning it and its length.
    pub fn read_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        // CIDv0 is a bare sha2-256 multihash.
        if bytes.len() >= 2 && bytes[0] == SHA2_256 as u8 && bytes[1] == 0x20 {
            if bytes.len() < 34 {
                return Err(Error::InvalidCid("truncated CIDv0".to_string()));
            }
            return Ok((Self(bytes[..34].to_vec()), 34));
        }

        let mut pos = 0;
        let mut next = |bytes: &[u8]| -> Result<u64> {
            let (value, len) = read_varint(&bytes[pos..])
                .map_err(|_| Error::InvalidCid("truncated varint".to_string()))?;
            pos += len;
            Ok(value)
        };

        let version = next(bytes)?;
        if version != 1 {
            return Err(Error::InvalidCid(format!("unsupported version {version}")));
        }
        let _codec = next(bytes)?;
        let _hash_code = next(bytes)?;
        let digest_len = next(bytes)? as usize;

        let end = pos
            .checked_add(digest_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::InvalidCid("truncated digest".to_string()))?;
        Ok((Self(bytes[..end].to_vec()), end))
    }

    /// Parse a DAG-CBOR link (tag 42 over a 0x00-prefixed binary CID).
    pub fn from_link(value: &Value) -> Result<Self> {
        match value {
            Value::Tag(CID_LINK_TAG, inner) => match inner.as_ref() {
                Value::Bytes(bytes) if bytes.first() == Some(&0) => Self::from_bytes(&bytes[1..]),
                _ => Err(Error::InvalidCid("link is not a prefixed byte string".to_string())),
            },
            _ => Err(Error::InvalidCid("expected tag 42".to_string())),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn is_v0(&self) -> bool {
        self.0.len() == 34 && self.0[0] == SHA2_256 as u8
    }
}

impl fmt::Display for Cid {
    /// Multibase base32 (lowercase, unpadded). CIDv0 is shown upgraded to v1.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = if self.is_v0() {
            let mut v1 = vec![0x01, DAG_PB as u8];
            v1.extend_from_slice(&self.0);
            base32_lower(&v1)
        } else {
            base32_lower(&self.0)
        };
        write!(f, "b{encoded}")
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Blocks of a commit's CAR archive, keyed by CID.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    blocks: HashMap<Cid, Vec<u8>>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a CAR v1 archive.
    pub fn from_car(bytes: &[u8]) -> Result<Self> {
        let (header_len, mut pos) = read_varint(bytes)?;
        let header_end = pos
            .checked_add(header_len as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::InvalidCar("truncated header".to_string()))?;

        let header: Value = ciborium::from_reader(&bytes[pos..header_end])?;
        match map_get(&header, "version") {
            Some(Value::Integer(v)) if i128::from(*v) == 1 => {}
            _ => return Err(Error::InvalidCar("expected version 1 header".to_string())),
        }
        pos = header_end;

        let mut blocks = HashMap::new();
        while pos < bytes.len() {
            let (section_len, len) = read_varint(&bytes[pos..])?;
            pos += len;
            let section_end = pos
                .checked_add(section_len as usize)
                .filter(|end| *end <= bytes.len())
                .ok_or_else(|| Error::InvalidCar("truncated section".to_string()))?;

            let section = &bytes[pos..section_end];
            let (cid, cid_len) = Cid::read_prefix(section)?;
            blocks.insert(cid, section[cid_len..].to_vec());
            pos = section_end;
        }

        Ok(Self { blocks })
    }

    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn insert(&mut self, cid: Cid, data: Vec<u8>) {
        self.blocks.insert(cid, data);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Look up a text key in a CBOR map.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Text(text) if text == key))
            .map(|(_, v)| v),
        _ => None,
    }
}

/// Look up a text-valued key in a CBOR map.
pub fn text_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match map_get(value, key) {
        Some(Value::Text(text)) => Some(text.as_str()),
        _ => None,
    }
}

/// Decodes record blocks and checks them against their expected shape.
pub trait RecordCodec: Send + Sync {
    /// Decode the block for `cid`. Returns `Ok(None)` when the block is absent.
    fn decode_block(&self, blocks: &BlockMap, cid: &Cid) -> Result<Option<Record>>;

    /// Whether `record` is a well-formed record of `kind`.
    fn validate_record(&self, kind: ContentKind, record: &Record) -> bool;
}

/// DAG-CBOR record codec with structural validation per content kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct DagCborCodec;

impl DagCborCodec {
    pub fn new() -> Self {
        Self
    }
}

impl RecordCodec for DagCborCodec {
    fn decode_block(&self, blocks: &BlockMap, cid: &Cid) -> Result<Option<Record>> {
        let Some(data) = blocks.get(cid) else {
            return Ok(None);
        };
        let record: Value = ciborium::from_reader(data)?;
        Ok(Some(record))
    }

    fn validate_record(&self, kind: ContentKind, record: &Record) -> bool {
        if text_field(record, "$type") != Some(kind.collection()) {
            return false;
        }
        if text_field(record, "createdAt").is_none() {
            return false;
        }

        match kind {
            ContentKind::Post => text_field(record, "text").is_some(),
            ContentKind::Repost | ContentKind::Like => map_get(record, "subject")
                .is_some_and(|subject| {
                    text_field(subject, "uri").is_some() && text_field(subject, "cid").is_some()
                }),
            ContentKind::Follow => {
                text_field(record, "subject").is_some_and(|did| did.starts_with("did:"))
            }
        }
    }
}
