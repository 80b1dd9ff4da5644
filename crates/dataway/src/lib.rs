//! 📡 dataway — the egress half of a telemetry agent.
//!
//! Points come in, get grouped, encoded, gzipped, parked in a WAL queue, and are
//! eventually POSTed to one or more dataway endpoints. Failures go to a disk
//! fail-cache and get another shot later.
//!
//! 🧠 Knowledge graph, leaves first: `point` → `body` (+ zipper, pool) → `grouper` →
//! `writer` → `wal` → `endpoint` → `delivery` → `supervisors` (flushers) → `dataway`.

use std::sync::Arc;

use anyhow::Context;
use prometheus::Registry;
use tokio::task::JoinHandle;

pub mod app_config;
pub mod body;
pub mod category;
pub mod context;
pub mod dataway;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod grouper;
pub mod metrics;
pub mod point;
pub mod token;
pub mod wal;
pub mod writer;

mod supervisors;

pub use crate::app_config::AppConfig;
pub use crate::category::Category;
pub use crate::context::RuntimeContext;
pub use crate::dataway::Dataway;
pub use crate::error::DatawayError;
pub use crate::point::{Encoding, Point};
pub use crate::writer::WriteOptions;

/// 🚀 Builds the dataway from config, registers its metrics on `registry`, and starts the
/// flushers. Trigger `dataway.context().exit` to stop; the handle resolves once they are done.
pub fn start(app_config: AppConfig, registry: &Registry) -> anyhow::Result<(Arc<Dataway>, JoinHandle<anyhow::Result<()>>)> {
    let ctx = RuntimeContext::new(registry).context("💀 could not register dataway metrics")?;
    let dataway = Dataway::new(app_config.dataway, ctx).context("💀 could not build the dataway from config")?;
    let dataway = Arc::new(dataway);
    let handle = dataway.start();
    Ok((dataway, handle))
}
