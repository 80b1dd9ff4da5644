//! 🚪 Dataway — the front door. Producers hand it points, it hands back nothing but `Ok`.
//!
//! 🎬 *[points arrive. they are grouped, encoded, zipped, queued.
//! the producer has already left. the flushers take it from here.]*
//!
//! # Knowledge Graph 🧠
//! - `Dataway::new` validates the URLs, builds one `Endpoint` each, one `WalQueue` per category
//!   that has flushers (`<wal.path>/<category>`), and the disk-only fail-cache (`<wal.path>/fc`).
//! - `write` → optional grouping (sinker) → `Writer::build_points_body` → WAL sink (or the
//!   direct sink for no-WAL writes).
//! - `X-Global-Tags` is the group key when the sinker is on, or the sorted global tags when it is off.
//! - `start` hands the whole thing to the `Supervisor`; the exit signal stops it.
//! - Everything else (`datakit_pull`, `election`, ...) goes to the first endpoint.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_config::DatawayConfig;
use crate::body::{Body, BodyPool, ScratchBuffers, Zipper};
use crate::category::{Category, WorkerShare};
use crate::context::RuntimeContext;
use crate::delivery::Delivery;
use crate::endpoint::{DatawayList, Endpoint};
use crate::error::{DatawayError, Result};
use crate::grouper::group_points;
use crate::point::Point;
use crate::supervisors::Supervisor;
use crate::token::check_token;
use crate::wal::{DiskCache, DiskCacheOptions, FileDiskCache, MemDiskCache, WalQueue, WalQueueOptions};
use crate::writer::{BodySink, WriteOptions, WriterPool};

pub const GLOBAL_TAGS_HEADER: &str = "X-Global-Tags";
const FAIL_CACHE_DIR: &str = "fc";

/// 📊 One queue's backlog, for the curious (and for `--drain`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// category name, or `fc` for the fail-cache
    pub queue: &'static str,
    pub mem_len: usize,
    pub disk_bytes: u64,
}

#[derive(Debug)]
pub struct Dataway {
    cfg: DatawayConfig,
    delivery: Arc<Delivery>,
    queues: HashMap<Category, Arc<WalQueue>>,
    global_tags: RwLock<BTreeMap<String, String>>,
    body_pool: Arc<BodyPool>,
    writer_pool: WriterPool,
    workers: usize,
    ctx: RuntimeContext,
}

/// 📥 Built bodies go into the category's WAL queue.
struct WalSink<'a> {
    queue: &'a WalQueue,
}

#[async_trait]
impl BodySink for WalSink<'_> {
    async fn on_body(&mut self, _opts: &WriteOptions, body: Body) -> anyhow::Result<()> {
        self.queue.put(body).await.with_context(|| format!("💀 WAL put on {} failed", self.queue.label()))
    }
}

/// 🏎️ Built bodies skip the queue and go straight out.
struct DirectSink<'a> {
    delivery: &'a Delivery,
    pool: &'a BodyPool,
    zipper: Zipper,
}

#[async_trait]
impl BodySink for DirectSink<'_> {
    async fn on_body(&mut self, _opts: &WriteOptions, mut body: Body) -> anyhow::Result<()> {
        let res = self.delivery.deliver(&mut body, &mut self.zipper).await;
        self.pool.release(body);
        res.context("💀 direct delivery failed")
    }
}

fn open_disk(cfg: &DatawayConfig, dir: &str, no_drop: bool) -> Result<Arc<dyn DiskCache>> {
    let opts = DiskCacheOptions { capacity: cfg.wal.capacity_bytes(), no_drop, ..Default::default() };
    Ok(match &cfg.wal.path {
        Some(root) => Arc::new(FileDiskCache::open(root.join(dir), opts)?),
        None => Arc::new(MemDiskCache::new(opts)),
    })
}

fn sorted_tags(tags: &BTreeMap<String, String>) -> String {
    tags.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

impl Dataway {
    /// 🏗️ Builds endpoints, queues and pools. Fails on bad URLs or an unusable WAL directory.
    pub fn new(cfg: DatawayConfig, ctx: RuntimeContext) -> Result<Self> {
        if cfg.urls.is_empty() {
            return Err(DatawayError::NoEndpoints);
        }
        let mut endpoints = Vec::with_capacity(cfg.urls.len());
        for url in &cfg.urls {
            endpoints.push(Arc::new(Endpoint::new(url, cfg.endpoint_options(), ctx.clone())?));
        }

        let workers = cfg.wal.resolved_workers();
        let body_pool = Arc::new(BodyPool::new(workers * 4, cfg.body_size_limit() * 2));
        if cfg.wal.path.is_none() {
            warn!("⚠️ no wal.path configured, the disk tier lives in memory and dies with the process");
        }

        let fail_cache = Arc::new(WalQueue::new(
            "fc",
            open_disk(&cfg, FAIL_CACHE_DIR, false)?,
            body_pool.clone(),
            ctx.clone(),
            WalQueueOptions { mem_cap: None, ..Default::default() },
        ));

        let mut queues = HashMap::new();
        for cat in Category::all() {
            let policy = cat.policy();
            let n = match policy.workers {
                WorkerShare::Configured => workers,
                WorkerShare::Single => 1,
                WorkerShare::Shared => continue,
            };
            let no_drop = cfg.wal.no_drop_categories.contains(&cat);
            let opts = WalQueueOptions {
                mem_cap: cfg.wal.resolved_mem_cap(n),
                no_drop,
                no_drop_retry: Duration::from_millis(cfg.wal.no_drop_retry_ms.max(1)),
            };
            let queue = WalQueue::new(policy.name, open_disk(&cfg, policy.name, no_drop)?, body_pool.clone(), ctx.clone(), opts);
            queues.insert(cat, Arc::new(queue));
        }

        let delivery = Arc::new(Delivery::new(endpoints, Some(fail_cache), cfg.gzip, cfg.wal.expire(), ctx.clone()));
        info!("🚪 dataway ready: {} endpoints, {} queues, {} workers", cfg.urls.len(), queues.len(), workers);

        Ok(Self {
            global_tags: RwLock::new(cfg.global_tags.clone()),
            writer_pool: WriterPool::new(workers * 2),
            cfg,
            delivery,
            queues,
            body_pool,
            workers,
            ctx,
        })
    }

    pub fn config(&self) -> &DatawayConfig {
        &self.cfg
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        self.delivery.endpoints()
    }

    pub(crate) fn delivery(&self) -> &Arc<Delivery> {
        &self.delivery
    }

    pub(crate) fn queues(&self) -> impl Iterator<Item = (&Category, &Arc<WalQueue>)> {
        self.queues.iter()
    }

    /// 🧵 Flushers a category's queue gets.
    pub fn workers_for(&self, cat: Category) -> usize {
        match cat.policy().workers {
            WorkerShare::Configured => self.workers,
            WorkerShare::Single => 1,
            WorkerShare::Shared => 0,
        }
    }

    /// 📝 Write options pre-filled from the config: encoding, gzip and body size limit.
    pub fn write_options(&self, cat: Category) -> WriteOptions {
        WriteOptions::new(cat)
            .encoding(self.cfg.content_encoding)
            .gzip(self.cfg.gzip)
            .batch_bytes(self.cfg.body_size_limit())
    }

    /// 🏷️ Replaces the global tags used for grouping and `X-Global-Tags`.
    pub fn update_global_tags(&self, tags: BTreeMap<String, String>) {
        match self.global_tags.write() {
            Ok(mut g) => *g = tags,
            Err(poisoned) => *poisoned.into_inner() = tags,
        }
    }

    pub fn global_tags(&self) -> BTreeMap<String, String> {
        match self.global_tags.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 📤 Writes `points` for `opts.category`. Errors are configuration-shaped; per-body
    /// delivery trouble is logged and counted, not returned.
    pub async fn write(&self, opts: WriteOptions, points: Vec<Point>) -> Result<()> {
        if opts.cache_clean {
            let mut scratch = ScratchBuffers::default();
            self.delivery.clean_fail_cache(&mut scratch, &mut Zipper::default()).await?;
        }
        if points.is_empty() {
            return Ok(());
        }
        match &opts.dynamic_url {
            Some(url) => {
                let parsed = Url::parse(url).map_err(|e| DatawayError::InvalidUrl(format!("{url}: {e}")))?;
                if !parsed.query_pairs().any(|(k, _)| k == "token") {
                    return Err(DatawayError::TokenMissing);
                }
            }
            None if opts.category.url_path().is_none() => {
                return Err(DatawayError::InvalidUrl(format!("category {} needs a dynamic URL", opts.category)));
            }
            None => {}
        }

        let mut opts = opts;
        if opts.batch_bytes.is_none() && opts.batch_size.is_none() {
            opts.batch_bytes = Some(self.cfg.body_size_limit());
        }

        let global_tags = self.global_tags();
        let groups = if self.cfg.enable_sinker {
            group_points(points, opts.category, &global_tags, &self.cfg.global_customer_keys, Some(&self.ctx.metrics))
        } else {
            HashMap::from([(sorted_tags(&global_tags), points)])
        };

        for (key, pts) in groups {
            let mut group_opts = opts.clone();
            if !key.is_empty() {
                group_opts = group_opts.header(GLOBAL_TAGS_HEADER, key);
            }
            self.write_group(group_opts, pts).await?;
        }
        Ok(())
    }

    async fn write_group(&self, opts: WriteOptions, points: Vec<Point>) -> Result<()> {
        let queue_cat = opts.category.policy().queue;
        let no_wal = opts.no_wal;
        let mut writer = self.writer_pool.get(opts, points);

        let res = if no_wal {
            let mut sink = DirectSink { delivery: &self.delivery, pool: &self.body_pool, zipper: Zipper::default() };
            writer.build_points_body(&self.body_pool, &self.ctx.metrics, &mut sink).await
        } else {
            match self.queues.get(&queue_cat) {
                Some(queue) => {
                    let mut sink = WalSink { queue };
                    writer.build_points_body(&self.body_pool, &self.ctx.metrics, &mut sink).await
                }
                None => Err(DatawayError::InvalidPoint(format!("no WAL queue for category {queue_cat}"))),
            }
        };
        if let Ok(n) = &res {
            debug!("📤 {} bodies built for {}", n, writer.options().category);
        }
        self.writer_pool.release(writer);
        res.map(|_| ())
    }

    /// 📊 Backlog per queue, fail-cache last.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut cats: Vec<_> = self.queues.iter().collect();
        cats.sort_by_key(|(cat, _)| **cat);
        let mut stats: Vec<_> = cats
            .into_iter()
            .map(|(_, q)| QueueStats { queue: q.label(), mem_len: q.mem_len(), disk_bytes: q.disk_size() })
            .collect();
        if let Some(fc) = self.delivery.fail_cache() {
            stats.push(QueueStats { queue: fc.label(), mem_len: 0, disk_bytes: fc.disk_size() });
        }
        stats
    }

    /// 🫗 True once every category queue is empty. The fail-cache does not count.
    pub fn is_drained(&self) -> bool {
        self.queues.values().all(|q| q.mem_len() == 0 && q.disk_size() == 0)
    }

    /// 🔄 Rebuilds every endpoint's HTTP client.
    pub fn refresh_clients(&self) -> Result<()> {
        for ep in self.endpoints() {
            ep.rebuild_client()?;
        }
        Ok(())
    }

    /// 🚀 Spawns the flushers. The handle resolves after `context().exit` fires and every
    /// worker has stopped.
    pub fn start(self: &Arc<Self>) -> JoinHandle<anyhow::Result<()>> {
        let supervisor = Supervisor::new(self.clone());
        tokio::spawn(supervisor.run())
    }

    /// 🔑 Offline token format check.
    pub fn check_token(&self, token: &str) -> Result<()> {
        check_token(token)
    }

    fn first_endpoint(&self) -> Result<&Arc<Endpoint>> {
        self.endpoints().first().ok_or(DatawayError::NoEndpoints)
    }

    pub async fn check_token_remote(&self, token: &str) -> Result<bool> {
        check_token(token)?;
        self.first_endpoint()?.check_token_remote(token).await
    }

    pub async fn datakit_pull(&self, args: &str) -> Result<Bytes> {
        self.first_endpoint()?.datakit_pull(args).await
    }

    pub async fn election(&self, namespace: &str, id: &str) -> Result<Bytes> {
        self.first_endpoint()?.election(namespace, id).await
    }

    pub async fn election_heartbeat(&self, namespace: &str, id: &str) -> Result<Bytes> {
        self.first_endpoint()?.election_heartbeat(namespace, id).await
    }

    pub async fn dataway_list(&self) -> Result<DatawayList> {
        self.first_endpoint()?.dataway_list().await
    }

    pub async fn time_diff(&self) -> Result<i64> {
        self.first_endpoint()?.time_diff().await
    }

    pub async fn upsert_object_labels(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.upsert_object_labels(payload).await
    }

    pub async fn delete_object_labels(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.delete_object_labels(payload).await
    }

    pub async fn remote_job(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.remote_job(payload).await
    }

    pub async fn usage_trace(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.usage_trace(payload).await
    }

    pub async fn workspace_query(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.workspace_query(payload).await
    }

    pub async fn query_raw(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.query_raw(payload).await
    }

    pub async fn upload_log(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.upload_log(&self.cfg.hostname, payload).await
    }

    pub async fn upload_profile(&self, content_type: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        self.first_endpoint()?.upload_profile(content_type, payload).await
    }
}
