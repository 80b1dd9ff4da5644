//! 🎬 *[a WAL queue fills with bodies. somewhere, a flusher polls.]*
//! *[it finds nothing. it naps for a hundred milliseconds. it polls again.]*
//! *[this is its whole life. it has made peace with it.]*
//!
//! 🚿 The FlushWorker: drains one category's WAL queue into the endpoints, and every
//! so often gives one fail-cached body another shot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Worker;
use crate::body::{ScratchBuffers, Zipper};
use crate::category::Category;
use crate::context::RuntimeContext;
use crate::delivery::Delivery;
use crate::wal::WalQueue;

#[derive(Debug)]
pub(crate) struct FlushWorker {
    category: Category,
    idx: usize,
    queue: Arc<WalQueue>,
    delivery: Arc<Delivery>,
    fail_cache_interval: Duration,
    idle_sleep: Duration,
    ctx: RuntimeContext,
}

impl FlushWorker {
    pub(crate) fn new(
        category: Category,
        idx: usize,
        queue: Arc<WalQueue>,
        delivery: Arc<Delivery>,
        fail_cache_interval: Duration,
        idle_sleep: Duration,
        ctx: RuntimeContext,
    ) -> Self {
        Self { category, idx, queue, delivery, fail_cache_interval, idle_sleep, ctx }
    }

    async fn nap(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.idle_sleep) => {}
            _ = self.ctx.exit.wait() => {}
        }
    }
}

impl Worker for FlushWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("🚿 flusher {}/{} started", self.category, self.idx);
            let mut scratch = ScratchBuffers::default();
            let mut zipper = Zipper::default();
            let mut last_clean = Instant::now();

            loop {
                if self.ctx.exit.is_set() {
                    info!("🏁 flusher {}/{} exiting", self.category, self.idx);
                    return Ok(());
                }

                if last_clean.elapsed() >= self.fail_cache_interval {
                    last_clean = Instant::now();
                    if let Err(e) = self.delivery.clean_fail_cache(&mut scratch, &mut zipper).await {
                        warn!("🧹 flusher {}/{} fail-cache clean: {}", self.category, self.idx, e);
                    }
                }

                match self.queue.get(&mut scratch) {
                    Ok(Some(mut body)) => {
                        if let Err(e) = self.delivery.deliver(&mut body, &mut zipper).await {
                            warn!("💥 flusher {}/{} could not deliver {}: {}", self.category, self.idx, body, e);
                        }
                        // released no matter what happened above
                        if let Some(back) = self.queue.pool().release(body) {
                            scratch = back;
                        }
                    }
                    Ok(None) => self.nap().await,
                    Err(e) => {
                        warn!("⚠️ flusher {}/{} WAL read: {}", self.category, self.idx, e);
                        self.nap().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyPool;
    use crate::context::test_context;
    use crate::endpoint::Endpoint;
    use crate::endpoint::tests::fast_opts;
    use crate::point::Encoding;
    use crate::wal::{DiskCacheOptions, MemDiskCache, WalQueueOptions};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn the_one_where_the_flusher_empties_the_queue_and_goes_home() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/write/logging"))
            .respond_with(ResponseTemplate::new(200))
            .expect(5)
            .mount(&server)
            .await;

        let ctx = test_context();
        let pool = Arc::new(BodyPool::new(8, 1 << 20));
        let queue = Arc::new(WalQueue::new(
            "logging",
            Arc::new(MemDiskCache::new(DiskCacheOptions::default())),
            pool.clone(),
            ctx.clone(),
            WalQueueOptions { mem_cap: Some(2), ..Default::default() },
        ));
        let ep = Arc::new(Endpoint::new(&server.uri(), fast_opts(), ctx.clone())?);
        let delivery = Arc::new(Delivery::new(vec![ep], None, true, None, ctx.clone()));

        for i in 0..5 {
            let mut b = pool.get();
            b.fill(Category::Logging, Encoding::LineProtocol, format!("log n={i}i {i}").as_bytes(), 1);
            queue.put(b).await?;
        }

        let handle = FlushWorker::new(
            Category::Logging,
            0,
            queue.clone(),
            delivery,
            Duration::from_secs(3600),
            Duration::from_millis(5),
            ctx.clone(),
        )
        .start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.metrics.points.with_label_values(&["logging", "OK"]).get() < 5 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ctx.exit.trigger();
        handle.await??;

        assert_eq!(ctx.metrics.points.with_label_values(&["logging", "OK"]).get(), 5);
        assert_eq!(queue.mem_len(), 0);
        assert_eq!(queue.disk_size(), 0);
        Ok(())
    }
}
