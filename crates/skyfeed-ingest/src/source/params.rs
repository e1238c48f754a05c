//! Resumption query parameter encoding.
//!
//! Scalars pass through, lists expand into repeated keys, dates render as
//! RFC 3339 UTC with millisecond precision, absent values are left out.

use chrono::{DateTime, SecondsFormat, Utc};
use url::form_urlencoded;

use crate::{Error, Result};

/// A query parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Absent,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Date(DateTime<Utc>),
    List(Vec<ParamValue>),
}

impl ParamValue {
    fn encode(&self) -> Vec<String> {
        match self {
            Self::Absent => Vec::new(),
            Self::Bool(b) => vec![b.to_string()],
            Self::Int(n) => vec![n.to_string()],
            Self::UInt(n) => vec![n.to_string()],
            Self::Float(n) => vec![n.to_string()],
            Self::Str(s) => vec![s.clone()],
            Self::Date(d) => vec![d.to_rfc3339_opts(SecondsFormat::Millis, true)],
            Self::List(items) => items.iter().flat_map(ParamValue::encode).collect(),
        }
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Into::into)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Convert loosely-typed JSON into a parameter value.
///
/// Objects have no query encoding and are rejected.
impl TryFrom<serde_json::Value> for ParamValue {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        use serde_json::Value;

        Ok(match value {
            Value::Null => Self::Absent,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Str(s),
            Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(ParamValue::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                return Err(Error::InvalidParam(format!(
                    "object with {} keys",
                    map.len()
                )));
            }
        })
    }
}

/// Encode parameters as an `application/x-www-form-urlencoded` query string.
pub fn encode_query_params<K: AsRef<str>>(params: &[(K, ParamValue)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        for encoded in value.encode() {
            serializer.append_pair(key.as_ref(), &encoded);
        }
    }
    serializer.finish()
}
