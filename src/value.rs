// Stream Values and Keys
//
// The core treats element payloads as opaque, serde-encodable values. The
// byte-size estimate feeds the bytes-read counter and the state cache weights.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Grouping key for a keyed element stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey(pub String);

impl StreamKey {
    pub fn new(key: impl Into<String>) -> Self {
        StreamKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamKey {
    fn from(key: &str) -> Self {
        StreamKey(key.to_string())
    }
}

impl From<String> for StreamKey {
    fn from(key: String) -> Self {
        StreamKey(key)
    }
}

/// Element value supporting various data types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(Timestamp),
    Array(Vec<StreamValue>),
    Object(HashMap<String, StreamValue>),
    Json(serde_json::Value),
}

impl StreamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StreamValue::Int64(v) => Some(*v),
            StreamValue::Float64(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StreamValue::Float64(v) => Some(*v),
            StreamValue::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StreamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StreamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[StreamValue]> {
        match self {
            StreamValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Estimated in-memory size in bytes, used for read accounting and cache
    /// weights. Fixed-width values count their wire width; containers add a
    /// small overhead per allocation.
    pub fn byte_size(&self) -> usize {
        match self {
            StreamValue::Null => 1,
            StreamValue::Bool(_) => 1,
            StreamValue::Int64(_) => 8,
            StreamValue::Float64(_) => 8,
            StreamValue::String(s) => s.len() + 24,
            StreamValue::Bytes(b) => b.len() + 24,
            StreamValue::Timestamp(_) => 8,
            StreamValue::Array(a) => a.iter().map(|v| v.byte_size()).sum::<usize>() + 24,
            StreamValue::Object(o) => {
                o.iter().map(|(k, v)| k.len() + v.byte_size()).sum::<usize>() + 48
            }
            StreamValue::Json(j) => j.to_string().len() + 32,
        }
    }
}

impl From<bool> for StreamValue {
    fn from(v: bool) -> Self {
        StreamValue::Bool(v)
    }
}

impl From<i64> for StreamValue {
    fn from(v: i64) -> Self {
        StreamValue::Int64(v)
    }
}

impl From<f64> for StreamValue {
    fn from(v: f64) -> Self {
        StreamValue::Float64(v)
    }
}

impl From<String> for StreamValue {
    fn from(v: String) -> Self {
        StreamValue::String(v)
    }
}

impl From<&str> for StreamValue {
    fn from(v: &str) -> Self {
        StreamValue::String(v.to_string())
    }
}
