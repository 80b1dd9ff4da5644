//! 🚚 Delivery — one body, every endpoint, and what to do when it does not go well.
//!
//! Shared by the flush workers and by no-WAL writes. The rules, in order:
//! 1. bodies older than the expiry are dropped on the spot;
//! 2. raw bodies get gzipped when gzip is on (fail-cache replays are sent as stored);
//! 3. every endpoint gets the body. A 4xx is that endpoint's final word: counted, dropped.
//!    Anything else on a fresh body sends it to the fail-cache (once, however many
//!    endpoints failed) unless the category does not cache and the writer did not
//!    ask for cache-all. On a replay it is an error, so the lease puts the body back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::body::{Body, BodyFrom, ScratchBuffers, Zipper, unix_now};
use crate::context::RuntimeContext;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::wal::WalQueue;

pub const FAIL_CACHE_RETRY_HEADER: &str = "X-Fail-Cache-Retry";

#[derive(Debug)]
pub struct Delivery {
    endpoints: Vec<Arc<Endpoint>>,
    fail_cache: Option<Arc<WalQueue>>,
    gzip: bool,
    /// bodies older than this are dropped instead of sent
    expire: Option<Duration>,
    ctx: RuntimeContext,
}

impl Delivery {
    pub fn new(
        endpoints: Vec<Arc<Endpoint>>,
        fail_cache: Option<Arc<WalQueue>>,
        gzip: bool,
        expire: Option<Duration>,
        ctx: RuntimeContext,
    ) -> Self {
        Self { endpoints, fail_cache, gzip, expire, ctx }
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn fail_cache(&self) -> Option<&Arc<WalQueue>> {
        self.fail_cache.as_ref()
    }

    fn expired(&self, body: &Body) -> bool {
        match self.expire {
            Some(ttl) if body.created_at() > 0 => unix_now() - body.created_at() > ttl.as_secs() as i64,
            _ => false,
        }
    }

    /// 📤 Sends `body` to every endpoint. Fresh bodies always come back `Ok` (failures are
    /// cached or dropped and counted); a replay that failed anywhere comes back `Err`.
    pub async fn deliver(&self, body: &mut Body, zipper: &mut Zipper) -> Result<()> {
        let cat = body.category().name();
        let metrics = &self.ctx.metrics;

        if self.expired(body) {
            warn!("⌛ dropping expired body ({}s old): {}", unix_now() - body.created_at(), body);
            metrics.flush_dropped.with_label_values(&[cat, "expired"]).inc();
            return Ok(());
        }

        let replay = body.from() == BodyFrom::FailCache;
        if !body.gzon() && self.gzip && !replay {
            body.gzip_with(zipper)?;
        }
        if replay {
            body.set_header(FAIL_CACHE_RETRY_HEADER, "1");
        }

        let started = Instant::now();
        let mut cached = false;
        let mut replay_err = None;

        for ep in &self.endpoints {
            match ep.write_point_data(body).await {
                Ok(()) => {}
                Err(e) if e.is_4xx() => {
                    warn!("🚫 {} dropped by {}: {}", body, ep.host(), e);
                    metrics.flush_dropped.with_label_values(&[cat, "4xx"]).inc();
                }
                Err(e) if e.is_unroutable() => {
                    warn!("🧭 {} has nowhere to go on {}: {}", body, ep.host(), e);
                    metrics.flush_dropped.with_label_values(&[cat, "invalid-url"]).inc();
                }
                Err(e) if replay => {
                    debug!("↩️ replay of {} to {} failed: {}", body, ep.host(), e);
                    replay_err = Some(e);
                }
                Err(e) => {
                    warn!("🔥 sending {} to {} failed: {}", body, ep.host(), e);
                    if !cached {
                        cached = true;
                        self.cache_or_drop(body).await;
                    }
                }
            }
        }

        metrics.flush_latency.observe(started.elapsed().as_secs_f64());
        match replay_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 💾 Puts a failed body into the fail-cache, or drops it when its category does not cache.
    async fn cache_or_drop(&self, body: &Body) {
        let cat = body.category();
        let metrics = &self.ctx.metrics;

        let fc = match &self.fail_cache {
            Some(fc) if cat.cache_on_fail() || body.cache_all() => fc,
            Some(_) => {
                warn!("🗑️ drop {:?} points on {}, category not cached", body.npts(), cat);
                metrics.flush_dropped.with_label_values(&[cat.name(), "not-cached"]).inc();
                return;
            }
            None => {
                metrics.flush_dropped.with_label_values(&[cat.name(), "no-fail-cache"]).inc();
                return;
            }
        };

        match fc.cache(body).await {
            Ok(()) => {
                info!("💾 cached {:?} points on {} for a later retry", body.npts(), cat);
                metrics.fail_cache.with_label_values(&[cat.name(), "cached"]).inc();
            }
            Err(e) => {
                warn!("💀 fail-cache put of {:?} points on {} failed: {}", body.npts(), cat, e);
                metrics.fail_cache.with_label_values(&[cat.name(), "error"]).inc();
            }
        }
    }

    /// 🧹 Replays one fail-cached body. Delivered bodies are committed, the rest rolled back
    /// for next time. Returns whether there was anything to replay.
    pub async fn clean_fail_cache(&self, scratch: &mut ScratchBuffers, zipper: &mut Zipper) -> Result<bool> {
        let Some(fc) = &self.fail_cache else {
            return Ok(false);
        };
        let Some(mut lease) = fc.disk_get(scratch).await? else {
            return Ok(false);
        };

        let cat = lease.body().category().name();
        let outcome = self.deliver(lease.body_mut(), zipper).await;
        let back = match outcome {
            Ok(()) => {
                debug!("🧹 fail-cache replay ok: {}", lease.body());
                self.ctx.metrics.fail_cache.with_label_values(&[cat, "replayed"]).inc();
                lease.commit()
            }
            Err(e) => {
                warn!("↩️ fail-cache replay failed, keeping it for later: {}", e);
                self.ctx.metrics.fail_cache.with_label_values(&[cat, "retry-later"]).inc();
                lease.rollback()
            }
        };
        if let Some(back) = back {
            *scratch = back;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyPool;
    use crate::category::Category;
    use crate::context::test_context;
    use crate::endpoint::tests::fast_opts;
    use crate::point::Encoding;
    use crate::wal::{DiskCacheOptions, MemDiskCache, WalQueueOptions};
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Rig {
        delivery: Delivery,
        disk: Arc<MemDiskCache>,
        pool: Arc<BodyPool>,
        ctx: RuntimeContext,
    }

    fn rig(servers: &[&MockServer], gzip: bool, expire: Option<Duration>) -> anyhow::Result<Rig> {
        let ctx = test_context();
        let pool = Arc::new(BodyPool::new(8, 1 << 20));
        let disk = Arc::new(MemDiskCache::new(DiskCacheOptions::default()));
        let fc = Arc::new(WalQueue::new(
            "fc",
            disk.clone(),
            pool.clone(),
            ctx.clone(),
            WalQueueOptions { mem_cap: None, ..Default::default() },
        ));
        let mut endpoints = Vec::new();
        for s in servers {
            endpoints.push(Arc::new(Endpoint::new(&s.uri(), fast_opts(), ctx.clone())?));
        }
        Ok(Rig { delivery: Delivery::new(endpoints, Some(fc), gzip, expire, ctx.clone()), disk, pool, ctx })
    }

    fn body(pool: &BodyPool, cat: Category) -> Body {
        let mut b = pool.get();
        b.fill(cat, Encoding::LineProtocol, b"m f=1i 1\nm f=2i 2", 2);
        b
    }

    async fn failing_server(status: u16) -> MockServer {
        let s = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(status)).mount(&s).await;
        s
    }

    #[tokio::test]
    async fn the_one_where_two_dead_endpoints_cache_the_body_once() -> anyhow::Result<()> {
        let (a, b) = (failing_server(503).await, failing_server(502).await);
        let rig = rig(&[&a, &b], false, None)?;
        let mut body = body(&rig.pool, Category::Logging);
        rig.delivery.deliver(&mut body, &mut Zipper::default()).await?;
        assert_eq!(rig.disk.len(), 1, "one body, one fail-cache record");
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["logging", "cached"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_metrics_are_not_worth_keeping() -> anyhow::Result<()> {
        let s = failing_server(500).await;
        let rig = rig(&[&s], false, None)?;
        let mut b = body(&rig.pool, Category::Metric);
        rig.delivery.deliver(&mut b, &mut Zipper::default()).await?;
        assert!(rig.disk.is_empty());
        assert_eq!(rig.ctx.metrics.flush_dropped.with_label_values(&["metric", "not-cached"]).get(), 1);

        let mut b = body(&rig.pool, Category::Metric);
        b.set_cache_all(true);
        rig.delivery.deliver(&mut b, &mut Zipper::default()).await?;
        assert_eq!(rig.disk.len(), 1, "cache-all overrides the category");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_4xx_is_dropped_not_cached() -> anyhow::Result<()> {
        let s = failing_server(400).await;
        let rig = rig(&[&s], false, None)?;
        let mut b = body(&rig.pool, Category::Logging);
        rig.delivery.deliver(&mut b, &mut Zipper::default()).await?;
        assert!(rig.disk.is_empty());
        assert_eq!(rig.ctx.metrics.flush_dropped.with_label_values(&["logging", "4xx"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_raw_bodies_get_zipped_on_the_way_out() -> anyhow::Result<()> {
        let s = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Content-Encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&s)
            .await;
        let rig = rig(&[&s], true, None)?;
        let mut b = body(&rig.pool, Category::Logging);
        rig.delivery.deliver(&mut b, &mut Zipper::default()).await?;
        assert!(b.gzon());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_stale_bodies_never_leave() -> anyhow::Result<()> {
        let s = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&s).await;
        let rig = rig(&[&s], false, Some(Duration::from_secs(60)))?;
        let mut b = body(&rig.pool, Category::Logging);
        b.set_created_at(unix_now() - 3600);
        rig.delivery.deliver(&mut b, &mut Zipper::default()).await?;
        assert_eq!(rig.ctx.metrics.flush_dropped.with_label_values(&["logging", "expired"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_fail_cache_gets_a_second_chance() -> anyhow::Result<()> {
        let s = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).up_to_n_times(3).mount(&s).await;
        Mock::given(method("POST"))
            .and(header("X-Fail-Cache-Retry", "1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&s)
            .await;
        let rig = rig(&[&s], false, None)?;
        let mut zipper = Zipper::default();

        let mut b = body(&rig.pool, Category::Logging);
        rig.delivery.deliver(&mut b, &mut zipper).await?;
        rig.pool.release(b);
        assert_eq!(rig.disk.len(), 1);

        let mut scratch = ScratchBuffers::default();
        assert!(rig.delivery.clean_fail_cache(&mut scratch, &mut zipper).await?);
        assert!(rig.disk.is_empty(), "replayed and committed");
        assert!(!rig.delivery.clean_fail_cache(&mut scratch, &mut zipper).await?, "nothing left");
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["logging", "replayed"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_replay_goes_back_on_the_shelf() -> anyhow::Result<()> {
        let s = failing_server(503).await;
        let rig = rig(&[&s], false, None)?;
        let mut zipper = Zipper::default();
        let mut b = body(&rig.pool, Category::Tracing);
        rig.delivery.deliver(&mut b, &mut zipper).await?;
        assert_eq!(rig.disk.len(), 1);

        let mut scratch = ScratchBuffers::default();
        assert!(rig.delivery.clean_fail_cache(&mut scratch, &mut zipper).await?);
        assert_eq!(rig.disk.len(), 1, "rolled back, not re-cached");
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["tracing", "cached"]).get(), 1);
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["tracing", "retry-later"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_body_with_nowhere_to_go_is_dropped() -> anyhow::Result<()> {
        let s = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&s).await;
        let rig = rig(&[&s], false, None)?;
        let mut zipper = Zipper::default();

        let mut b = body(&rig.pool, Category::Unknown);
        b.set_cache_all(true);
        rig.delivery.deliver(&mut b, &mut zipper).await?;
        let mut b = body(&rig.pool, Category::DynamicDWCategory);
        rig.delivery.deliver(&mut b, &mut zipper).await?;

        assert!(rig.disk.is_empty(), "an unroutable body is never cached, cache-all or not");
        assert_eq!(rig.ctx.metrics.flush_dropped.with_label_values(&["unknown", "invalid-url"]).get(), 1);
        assert_eq!(rig.ctx.metrics.flush_dropped.with_label_values(&["dynamic_dw", "invalid-url"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_unroutable_record_does_not_block_the_shelf() -> anyhow::Result<()> {
        let s = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(1).mount(&s).await;
        let rig = rig(&[&s], false, None)?;
        let fc = rig.delivery.fail_cache().ok_or_else(|| anyhow::anyhow!("rig has a fail-cache"))?;

        // a record left behind with no URL sits in front of a good one
        fc.cache(&body(&rig.pool, Category::Unknown)).await?;
        fc.cache(&body(&rig.pool, Category::Logging)).await?;
        assert_eq!(rig.disk.len(), 2);

        let mut zipper = Zipper::default();
        let mut scratch = ScratchBuffers::default();
        for _ in 0..2 {
            assert!(rig.delivery.clean_fail_cache(&mut scratch, &mut zipper).await?);
        }
        assert!(rig.disk.is_empty(), "the dead record is dropped and the one behind it delivered");
        assert_eq!(rig.ctx.metrics.flush_dropped.with_label_values(&["unknown", "invalid-url"]).get(), 1);
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["logging", "replayed"]).get(), 1);
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["logging", "retry-later"]).get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_stubborn_head_is_retried_every_round() -> anyhow::Result<()> {
        let s = failing_server(503).await;
        let rig = rig(&[&s], false, None)?;
        let mut zipper = Zipper::default();
        let mut b = body(&rig.pool, Category::Security);
        rig.delivery.deliver(&mut b, &mut zipper).await?;

        let mut scratch = ScratchBuffers::default();
        for _ in 0..3 {
            assert!(rig.delivery.clean_fail_cache(&mut scratch, &mut zipper).await?);
        }
        assert_eq!(rig.disk.len(), 1, "still waiting for the upstream, never lost");
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["security", "retry-later"]).get(), 3);
        assert_eq!(rig.ctx.metrics.fail_cache.with_label_values(&["security", "cached"]).get(), 1);
        Ok(())
    }
}
