//! 🔄 RefreshWorker — swaps every endpoint's HTTP client on a timer, so long-lived
//! connection pools pick up DNS changes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Worker;
use crate::context::RuntimeContext;
use crate::endpoint::Endpoint;

#[derive(Debug)]
pub(crate) struct RefreshWorker {
    endpoints: Vec<Arc<Endpoint>>,
    interval: Duration,
    ctx: RuntimeContext,
}

impl RefreshWorker {
    pub(crate) fn new(endpoints: Vec<Arc<Endpoint>>, interval: Duration, ctx: RuntimeContext) -> Self {
        Self { endpoints, interval, ctx }
    }
}

impl Worker for RefreshWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = self.ctx.exit.wait() => {
                        debug!("🏁 client refresher exiting");
                        return Ok(());
                    }
                }
                for ep in &self.endpoints {
                    if let Err(e) = ep.rebuild_client() {
                        warn!("🔄 could not rebuild the client for {}: {}", ep.host(), e);
                    }
                }
            }
        })
    }
}
