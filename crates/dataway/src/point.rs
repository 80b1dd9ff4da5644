//! 📍 Points — the smallest thing we ship. A measurement, some tags, some fields, a timestamp.
//!
//! This is deliberately the minimal model the egress path needs: enough to group,
//! encode, and decode, and nothing about the full type system a collector would carry.
//!
//! 🧠 Knowledge graph:
//! - `Point` → `line_protocol` / `json` text encodings.
//! - `encoder::PointEncoder` slices a point slice into batch-limited chunks.
//! - `Encoding` travels with every `Body` so the upstream knows what it is reading.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::DatawayError;

pub mod encoder;
pub mod json;
pub mod line_protocol;

pub use encoder::{BatchLimit, PointEncoder};

/// 🧮 A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// 📍 One data point. Tags and fields keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    name: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    /// unix nanoseconds
    time: i64,
}

impl Point {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), tags: Vec::new(), fields: Vec::new(), time: 0 }
    }

    /// 🏷️ Adds or replaces a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        match self.tags.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.tags.push((key, value)),
        }
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let (key, value) = (key.into(), value.into());
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// 🖨️ Stable, human-facing rendering. Tests compare these instead of bytes.
    pub fn pretty(&self) -> String {
        let mut out = format!("{} ", self.name);
        for (k, v) in &self.tags {
            out.push_str(&format!("{k}={v} "));
        }
        for (k, v) in &self.fields {
            out.push_str(&format!("{k}={v:?} "));
        }
        out.push_str(&self.time.to_string());
        out
    }
}

/// 📨 What the HTTP body is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    LineProtocol,
    Protobuf,
    Json,
}

impl Encoding {
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::LineProtocol => "text/plain; charset=utf-8",
            Encoding::Protobuf => "application/x-protobuf",
            Encoding::Json => "application/json",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::LineProtocol => "line-protocol",
            Encoding::Protobuf => "protobuf",
            Encoding::Json => "json",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Encoding::LineProtocol => 1,
            Encoding::Protobuf => 2,
            Encoding::Json => 3,
        }
    }

    pub(crate) fn from_u8(b: u8) -> Option<Encoding> {
        match b {
            1 => Some(Encoding::LineProtocol),
            2 => Some(Encoding::Protobuf),
            3 => Some(Encoding::Json),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = DatawayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line-protocol" | "lineprotocol" | "v1" | "" => Ok(Encoding::LineProtocol),
            "protobuf" | "v2" => Ok(Encoding::Protobuf),
            "json" => Ok(Encoding::Json),
            other => Err(DatawayError::InvalidPoint(format!("unknown encoding {other:?}"))),
        }
    }
}

impl<'de> Deserialize<'de> for Encoding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 📖 Decodes a payload back into points. Protobuf is write-only tag here.
pub fn decode(enc: Encoding, data: &[u8]) -> crate::error::Result<Vec<Point>> {
    match enc {
        Encoding::LineProtocol => line_protocol::decode(data),
        Encoding::Json => json::decode(data),
        Encoding::Protobuf => Err(DatawayError::UnsupportedEncoding("protobuf")),
    }
}
