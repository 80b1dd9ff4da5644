//! 🔧 App Configuration — the TOML-plus-env pipeline that tells the dataway where to send things.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every on-call at 3am 🦆
//!
//! 🏗️ Powered by Figment. `DW_*` env vars are the base layer, nested keys split on `__`
//! (`DW_DATAWAY__WAL__WORKERS=4`), and an optional TOML file goes on top.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::category::Category;
use crate::endpoint::EndpointOptions;
use crate::point::Encoding;
use crate::writer::{DEFAULT_MAX_RAW_BODY_SIZE, MIN_RAW_BODY_SIZE};

/// 📦 The whole config. One section for now, room for more.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub dataway: DatawayConfig,
}

/// 📡 Where data goes and how hard we try.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatawayConfig {
    /// `http(s)://host[:port]?token=tkn_...`, one per upstream
    pub urls: Vec<String>,
    pub http_timeout_ms: u64,
    /// attempts per request, clamped to 1..=10
    pub max_retry_count: u32,
    pub retry_delay_ms: u64,
    /// byte limit per body, at least 1 MiB
    pub max_raw_body_size: usize,
    pub gzip: bool,
    pub content_encoding: Encoding,
    pub http_proxy: Option<String>,
    pub max_idle_conns_per_host: usize,
    pub idle_timeout_ms: u64,
    /// rebuild HTTP clients this often; 0 = never
    pub client_refresh_ms: u64,
    /// group points by global tags and customer keys before building bodies
    pub enable_sinker: bool,
    pub global_customer_keys: Vec<String>,
    pub global_tags: BTreeMap<String, String>,
    pub http_headers: BTreeMap<String, String>,
    pub hostname: String,
    pub wal: WalConfig,
}

impl Default for DatawayConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            http_timeout_ms: 30_000,
            max_retry_count: 4,
            retry_delay_ms: 1_000,
            max_raw_body_size: DEFAULT_MAX_RAW_BODY_SIZE,
            gzip: true,
            content_encoding: Encoding::LineProtocol,
            http_proxy: None,
            max_idle_conns_per_host: 64,
            idle_timeout_ms: 90_000,
            client_refresh_ms: 0,
            enable_sinker: false,
            global_customer_keys: Vec::new(),
            global_tags: BTreeMap::new(),
            http_headers: BTreeMap::new(),
            hostname: String::new(),
            wal: WalConfig::default(),
        }
    }
}

/// 🚰 WAL knobs.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WalConfig {
    /// disk cache root; unset keeps the disk tier in memory (lost on restart)
    pub path: Option<PathBuf>,
    /// per-category disk cap
    pub max_capacity_gb: f64,
    /// flushers per high-volume category; 0 = twice the CPU count
    pub workers: usize,
    /// memory slots per queue; 0 = one per worker, negative = disk only
    pub mem_cap: i64,
    pub no_drop_categories: Vec<Category>,
    pub fail_cache_clean_interval_ms: u64,
    /// drop bodies older than this; 0 = never
    pub expire_secs: u64,
    pub no_drop_retry_ms: u64,
    pub idle_sleep_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_capacity_gb: 2.0,
            workers: 0,
            mem_cap: 0,
            no_drop_categories: Vec::new(),
            fail_cache_clean_interval_ms: 30_000,
            expire_secs: 0,
            no_drop_retry_ms: 100,
            idle_sleep_ms: 100,
        }
    }
}

impl DatawayConfig {
    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            max_retry_count: self.max_retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            proxy: self.http_proxy.clone(),
            http_headers: self.http_headers.clone(),
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            hostname: self.hostname.clone(),
        }
    }

    /// 📏 Body byte limit, never below the 1 MiB floor.
    pub fn body_size_limit(&self) -> usize {
        self.max_raw_body_size.max(MIN_RAW_BODY_SIZE)
    }
}

impl WalConfig {
    /// 🧵 Configured worker count, or twice the CPUs when left at 0.
    pub fn resolved_workers(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(2),
            n => n,
        }
    }

    /// 🧠 Memory slots for a queue with `workers` flushers. `None` = disk only.
    pub fn resolved_mem_cap(&self, workers: usize) -> Option<usize> {
        match self.mem_cap {
            n if n < 0 => None,
            0 => Some(workers.max(1)),
            n => Some(n as usize),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        (self.max_capacity_gb.max(0.0) * (1u64 << 30) as f64) as u64
    }

    pub fn expire(&self) -> Option<Duration> {
        (self.expire_secs > 0).then(|| Duration::from_secs(self.expire_secs))
    }
}

/// 🚀 Load the config from `DW_*` env vars and, when given, a TOML file (TOML wins).
///
/// 💀 Returns an error if the config is unparseable, with a message that says which layer to blame.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!("🔧 Loading configuration: {:#?}", config_file_name.unwrap_or(Path::new("")));

    let config = Figment::new().merge(Env::prefixed("DW_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (DW_*). \
             Check the TOML, then check the env. In that order, probably.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (DW_*). \
                 No file was provided, this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
