//! 💀 Errors — the named kind, for callers who need to `match` on the tragedy.
//!
//! 🧠 Knowledge graph:
//! - Library seams that callers branch on (4xx vs 5xx, empty vs invalid token,
//!   disk full) return `DatawayError`.
//! - Everything wiring-shaped (config, supervisor, CLI) stays on `anyhow::Result`
//!   and `.context("💀 ...")`, same as it ever was.
//! - Ancient proverb: "He who stringly-types his errors, greps his logs at 3am." 🦆

use thiserror::Error;

/// 🏷️ Every way a point can fail to leave the building, with a name tag on.
#[derive(Debug, Error)]
pub enum DatawayError {
    /// 🚫 The upstream looked at our points and said "no". Not retried, not cached.
    #[error("write points 4xx: status {status}")]
    WritePoints4XX { status: u16 },

    /// 🔥 5xx after all retries. Eligible for the fail-cache.
    #[error("dataway internal error: status {status}")]
    DatawayInternal { status: u16 },

    /// 🧟 No response at all came back.
    #[error("request terminated")]
    RequestTerminated,

    #[error("all {attempts} retry attempts failed: {last_error}")]
    AllRetryFailed { attempts: u32, last_error: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}, only http/https allowed")]
    UnsupportedScheme(String),

    #[error("empty token")]
    EmptyToken,

    #[error("invalid token")]
    InvalidToken,

    /// 🔒 Election APIs need `?token=` in the configured URL.
    #[error("token missing")]
    TokenMissing,

    #[error("no dataway endpoint configured")]
    NoEndpoints,

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(&'static str),

    #[error("corrupted body record: {0}")]
    CorruptedRecord(&'static str),

    /// 💾 The disk tier is at capacity and this category does not drop.
    #[error("disk cache full")]
    DiskFull,

    /// 📬 A non-2xx answer from an auxiliary API, body kept for the post-mortem.
    #[error("{api} returned {status}: {body}")]
    Status { api: String, status: u16, body: String },

    #[error("invalid point: {0}")]
    InvalidPoint(String),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DatawayError {
    /// 🚫 4xx means the payload itself is the problem; retrying or caching it is pointless.
    pub fn is_4xx(&self) -> bool {
        matches!(self, DatawayError::WritePoints4XX { .. })
    }

    /// 🧭 The body has no usable URL. Sending it again later cannot help.
    pub fn is_unroutable(&self) -> bool {
        matches!(self, DatawayError::InvalidUrl(_) | DatawayError::UnsupportedScheme(_))
    }
}

pub type Result<T, E = DatawayError> = std::result::Result<T, E>;
