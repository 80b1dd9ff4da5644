//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where bodies pile up in queues..."
//! 🎬 "One supervisor dared to flush them all."
//!
//! 📦 The Supervisor spawns one flusher per (category, worker slot), plus the client
//! refresher when one is configured, and waits for all of them to go home.
//!
//! ⚠️ The workers stay private. You talk to the supervisor, the supervisor talks to them.

mod workers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dataway::Dataway;
use workers::{FlushWorker, RefreshWorker, Worker};

pub(crate) struct Supervisor {
    dataway: Arc<Dataway>,
}

impl Supervisor {
    pub(crate) fn new(dataway: Arc<Dataway>) -> Self {
        Self { dataway }
    }

    /// 🧵 Spawns every worker and hands back their handles.
    pub(crate) fn start_workers(&self) -> Vec<JoinHandle<Result<()>>> {
        let dw = &self.dataway;
        let cfg = dw.config();
        let ctx = dw.context();
        let mut handles = Vec::new();

        for (cat, queue) in dw.queues() {
            let n = dw.workers_for(*cat);
            info!("🧵 starting {} flushers for {}", n, cat);
            for idx in 0..n {
                let worker = FlushWorker::new(
                    *cat,
                    idx,
                    queue.clone(),
                    dw.delivery().clone(),
                    Duration::from_millis(cfg.wal.fail_cache_clean_interval_ms),
                    Duration::from_millis(cfg.wal.idle_sleep_ms.max(1)),
                    ctx.clone(),
                );
                handles.push(worker.start());
            }
        }

        if cfg.client_refresh_ms > 0 {
            let refresher = RefreshWorker::new(
                dw.delivery().endpoints().to_vec(),
                Duration::from_millis(cfg.client_refresh_ms),
                ctx.clone(),
            );
            handles.push(refresher.start());
        }
        handles
    }

    /// 🚀 Starts everything and waits until the exit signal has sent every worker home.
    pub(crate) async fn run(self) -> Result<()> {
        let handles = self.start_workers();
        let total = handles.len();
        for joined in join_all(handles).await {
            joined.context("💀 a dataway worker panicked")??;
        }
        info!("🏁 all {} dataway workers stopped", total);
        Ok(())
    }
}
