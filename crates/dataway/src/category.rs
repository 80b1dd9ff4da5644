//! 🗂️ Categories — the "what kind of data is this" label every point carries.
//!
//! 🧠 Knowledge graph: each category owns one row in `POLICIES`. That row decides
//! the write URL, the synthetic grouping tag, whether failed bodies get a second
//! chance on disk, how many flush workers drain it, and which WAL queue it rides.
//! Add a category → add a row. Nothing else in the crate branches on category names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::DatawayError;

/// 📦 Data categories understood by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Metric,
    MetricDeprecated,
    Network,
    KeyEvent,
    Object,
    ObjectChange,
    CustomObject,
    Logging,
    Tracing,
    Rum,
    Security,
    Profiling,
    DynamicDWCategory,
    Unknown,
}

/// 🏷️ Which tag the grouper may synthesize from the measurement name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticTag {
    Source,
    Measurement,
    Class,
    None,
}

impl SyntheticTag {
    pub fn key(self) -> Option<&'static str> {
        match self {
            SyntheticTag::Source => Some("source"),
            SyntheticTag::Measurement => Some("measurement"),
            SyntheticTag::Class => Some("class"),
            SyntheticTag::None => None,
        }
    }
}

/// 🧵 How many flush workers a category gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerShare {
    /// the configured worker count
    Configured,
    Single,
    /// no dedicated workers, writes ride another category's queue
    Shared,
}

/// 📜 One row of the policy table.
#[derive(Debug, Clone, Copy)]
pub struct CategoryPolicy {
    pub category: Category,
    pub name: &'static str,
    pub url_path: Option<&'static str>,
    pub synthetic_tag: SyntheticTag,
    pub cache_on_fail: bool,
    pub workers: WorkerShare,
    /// the category whose WAL queue carries this category's bodies
    pub queue: Category,
}

const fn row(
    category: Category,
    name: &'static str,
    url_path: Option<&'static str>,
    synthetic_tag: SyntheticTag,
    cache_on_fail: bool,
    workers: WorkerShare,
    queue: Category,
) -> CategoryPolicy {
    CategoryPolicy { category, name, url_path, synthetic_tag, cache_on_fail, workers, queue }
}

use Category as C;
use SyntheticTag as T;
use WorkerShare as W;

// 🗺️ The whole category story, one row each. Metric-ish and object-ish data is
// refreshed by the next collection round anyway, so it does not get fail-cached.
// Rows without a URL are never cached: a replay would have nowhere to go.
static POLICIES: [CategoryPolicy; 14] = [
    row(C::Metric, "metric", Some("/v1/write/metric"), T::Measurement, false, W::Configured, C::Metric),
    row(C::MetricDeprecated, "metrics", Some("/v1/write/metrics"), T::Measurement, false, W::Shared, C::Metric),
    row(C::Network, "network", Some("/v1/write/network"), T::Source, true, W::Single, C::Network),
    row(C::KeyEvent, "keyevent", Some("/v1/write/keyevent"), T::Source, true, W::Single, C::KeyEvent),
    row(C::Object, "object", Some("/v1/write/object"), T::Class, false, W::Single, C::Object),
    row(C::ObjectChange, "object_change", Some("/v1/write/object_change"), T::Class, false, W::Single, C::ObjectChange),
    row(C::CustomObject, "custom_object", Some("/v1/write/custom_object"), T::Class, false, W::Single, C::CustomObject),
    row(C::Logging, "logging", Some("/v1/write/logging"), T::Source, true, W::Configured, C::Logging),
    row(C::Tracing, "tracing", Some("/v1/write/tracing"), T::None, true, W::Configured, C::Tracing),
    row(C::Rum, "rum", Some("/v1/write/rum"), T::Source, true, W::Configured, C::Rum),
    row(C::Security, "security", Some("/v1/write/security"), T::None, true, W::Single, C::Security),
    row(C::Profiling, "profiling", Some("/v1/write/profiling"), T::None, true, W::Single, C::Profiling),
    row(C::DynamicDWCategory, "dynamic_dw", None, T::None, false, W::Single, C::DynamicDWCategory),
    row(C::Unknown, "unknown", None, T::None, false, W::Single, C::Unknown),
];

impl Category {
    /// 📜 The policy row. Table is indexed by discriminant, so this is a plain load.
    pub fn policy(self) -> &'static CategoryPolicy {
        &POLICIES[self as usize]
    }

    pub fn all() -> impl Iterator<Item = Category> {
        POLICIES.iter().map(|p| p.category)
    }

    pub fn name(self) -> &'static str {
        self.policy().name
    }

    pub fn url_path(self) -> Option<&'static str> {
        self.policy().url_path
    }

    pub fn cache_on_fail(self) -> bool {
        self.policy().cache_on_fail
    }

    /// 🔢 Single-byte tag for disk records.
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(b: u8) -> Option<Category> {
        POLICIES.get(b as usize).map(|p| p.category)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = DatawayError;

    /// Accepts the short name ("logging") or the write path ("/v1/write/logging").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        POLICIES
            .iter()
            .find(|p| p.name == s || p.url_path == Some(s))
            .map(|p| p.category)
            .ok_or_else(|| DatawayError::InvalidPoint(format!("unknown category {s:?}")))
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
