//! ✍️ Writer — turns a pile of points into bodies and hands each one to a `BodySink`.
//!
//! 🎬 *[ten thousand points walk into a writer. eleven bodies walk out.
//! three points were too fat to fit through the door. they are counted. they are not sent.]*
//!
//! # Knowledge Graph 🧠
//! - `WriteOptions`: what to write and how (category, batch limit, encoding, gzip, headers,
//!   dynamic URL, cache-all/no-WAL/cache-clean). Builder methods, cloned per group.
//! - `Writer`: one build job. Owns its own `Zipper` and encode buffer, so it stays warm
//!   in the `WriterPool` between jobs.
//! - `BodySink`: where finished bodies go. The WAL sink queues them, the direct sink
//!   delivers them on the spot. Sink errors are logged and counted, the next chunk still goes.

use std::time::Instant;

use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use tracing::{debug, warn};

use crate::body::{Body, BodyPool, Zipper};
use crate::category::Category;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::point::{BatchLimit, Encoding, Point, PointEncoder};

/// 📏 Default byte limit per body when neither a byte nor a point limit is set.
pub const DEFAULT_MAX_RAW_BODY_SIZE: usize = 10 << 20;
/// 📏 Smallest byte limit we accept from config.
pub const MIN_RAW_BODY_SIZE: usize = 1 << 20;

/// 🔧 How one write should be carried out.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    pub category: Category,
    /// max points per body
    pub batch_size: Option<usize>,
    /// max raw bytes per body; wins over `batch_size`
    pub batch_bytes: Option<usize>,
    pub encoding: Encoding,
    pub gzip: bool,
    pub headers: Vec<(String, String)>,
    pub dynamic_url: Option<String>,
    /// fail-cache this write even if its category normally drops
    pub cache_all: bool,
    /// skip the WAL and deliver right away
    pub no_wal: bool,
    /// replay one fail-cached body before writing
    pub cache_clean: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::new(Category::Unknown)
    }
}

impl WriteOptions {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            batch_size: None,
            batch_bytes: None,
            encoding: Encoding::LineProtocol,
            gzip: true,
            headers: Vec::new(),
            dynamic_url: None,
            cache_all: false,
            no_wal: false,
            cache_clean: false,
        }
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = (n > 0).then_some(n);
        self
    }

    pub fn batch_bytes(mut self, n: usize) -> Self {
        self.batch_bytes = (n > 0).then_some(n);
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn gzip(mut self, on: bool) -> Self {
        self.gzip = on;
        self
    }

    /// 🏷️ Adds or replaces one HTTP header (case-insensitive key match).
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
        self
    }

    pub fn dynamic_url(mut self, url: impl Into<String>) -> Self {
        self.dynamic_url = Some(url.into());
        self
    }

    pub fn cache_all(mut self, on: bool) -> Self {
        self.cache_all = on;
        self
    }

    pub fn no_wal(mut self, on: bool) -> Self {
        self.no_wal = on;
        self
    }

    pub fn cache_clean(mut self, on: bool) -> Self {
        self.cache_clean = on;
        self
    }

    /// 📏 The effective chunk limit. Bytes beat points; neither means the default byte cap.
    pub fn batch_limit(&self) -> BatchLimit {
        match (self.batch_bytes, self.batch_size) {
            (Some(b), _) => BatchLimit::Bytes(b),
            (None, Some(n)) => BatchLimit::Points(n),
            (None, None) => BatchLimit::Bytes(DEFAULT_MAX_RAW_BODY_SIZE),
        }
    }
}

/// 🕳️ Where built bodies go. Implementations own the body from here on, releasing it
/// back to its pool is their job.
#[async_trait]
pub trait BodySink: Send {
    async fn on_body(&mut self, opts: &WriteOptions, body: Body) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct Writer {
    opts: WriteOptions,
    points: Vec<Point>,
    zipper: Zipper,
    encode_buf: Vec<u8>,
}

impl Default for Writer {
    fn default() -> Self {
        Self { opts: WriteOptions::default(), points: Vec::new(), zipper: Zipper::default(), encode_buf: Vec::new() }
    }
}

impl Writer {
    pub fn options(&self) -> &WriteOptions {
        &self.opts
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    fn reset(&mut self) {
        self.opts = WriteOptions::default();
        self.points.clear();
        self.encode_buf.clear();
    }

    /// 🏗️ Encodes the writer's points chunk by chunk and feeds each body to `sink`.
    /// Returns how many bodies were built.
    pub async fn build_points_body(
        &mut self,
        pool: &BodyPool,
        metrics: &Metrics,
        sink: &mut dyn BodySink,
    ) -> Result<usize> {
        let cat = self.opts.category;
        let enc = self.opts.encoding;
        let gzip_label = if self.opts.gzip { "true" } else { "false" };
        let labels = [cat.name(), enc.name(), gzip_label];

        let mut encoder = PointEncoder::new(enc, self.opts.batch_limit())?;
        let mut cursor = 0;
        let mut built = 0;

        loop {
            let started = Instant::now();
            let n = encoder.next_chunk(&self.points, &mut cursor, &mut self.encode_buf)?;

            let skipped = encoder.take_skipped();
            if skipped > 0 {
                warn!("🐘 skipped {} {} points larger than the body limit", skipped, cat);
                metrics.skipped_points.with_label_values(&[cat.name()]).inc_by(skipped as u64);
            }
            if n == 0 {
                break;
            }

            let mut body = pool.get();
            body.fill(cat, enc, &self.encode_buf, n);
            if self.opts.gzip {
                if let Err(e) = body.gzip_with(&mut self.zipper) {
                    pool.release(body);
                    return Err(e.into());
                }
            }
            for (k, v) in &self.opts.headers {
                body.set_header(k.as_str(), v.as_str());
            }
            body.set_dynamic_url(self.opts.dynamic_url.clone());
            body.set_cache_all(self.opts.cache_all);

            metrics.build_cost.with_label_values(&labels).observe(started.elapsed().as_secs_f64());
            metrics.build_bytes.with_label_values(&labels).observe(body.raw_len() as f64);
            metrics.build_points.with_label_values(&labels).observe(n as f64);
            metrics.build_batches.with_label_values(&labels).inc();
            debug!("🏗️ built {}", body);
            built += 1;

            if let Err(e) = sink.on_body(&self.opts, body).await {
                warn!("💥 {} body callback failed, moving on: {:#}", cat, e);
                metrics.build_callback_errors.with_label_values(&[cat.name()]).inc();
            }
        }
        Ok(built)
    }
}

/// ♻️ Keeps writers (and their warm zippers) around between writes.
#[derive(Debug)]
pub struct WriterPool {
    free: ArrayQueue<Writer>,
}

impl WriterPool {
    pub fn new(capacity: usize) -> Self {
        Self { free: ArrayQueue::new(capacity.max(1)) }
    }

    pub fn get(&self, opts: WriteOptions, points: Vec<Point>) -> Writer {
        let mut w = self.free.pop().unwrap_or_default();
        w.opts = opts;
        w.points = points;
        w
    }

    /// 🧽 Resets and shelves the writer. Extra writers beyond capacity are just dropped.
    pub fn release(&self, mut w: Writer) {
        w.reset();
        let _ = self.free.push(w);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::point;

    /// 🧪 Collects bodies instead of sending them. Optionally fails every call.
    #[derive(Debug, Default)]
    pub(crate) struct CollectSink {
        pub(crate) bodies: Vec<Body>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl BodySink for CollectSink {
        async fn on_body(&mut self, _opts: &WriteOptions, body: Body) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("sink says no");
            }
            self.bodies.push(body);
            Ok(())
        }
    }

    fn points(n: usize) -> Vec<Point> {
        (0..n).map(|i| Point::new("cpu").with_tag("host", format!("h{i}")).with_field("usage", i as f64).with_time(1)).collect()
    }

    fn raw(body: &Body) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        if body.gzon() {
            std::io::Read::read_to_end(&mut flate2::read::GzDecoder::new(body.payload()), &mut out)?;
        } else {
            out.extend_from_slice(body.payload());
        }
        Ok(out)
    }

    #[test]
    fn the_one_where_bytes_beat_points() {
        let opts = WriteOptions::new(Category::Logging).batch_size(10).batch_bytes(4096);
        assert_eq!(opts.batch_limit(), BatchLimit::Bytes(4096));
        assert_eq!(WriteOptions::new(Category::Logging).batch_size(10).batch_limit(), BatchLimit::Points(10));
        assert_eq!(WriteOptions::default().batch_limit(), BatchLimit::Bytes(DEFAULT_MAX_RAW_BODY_SIZE));
    }

    #[tokio::test]
    async fn the_one_where_points_arrive_in_tidy_batches() -> anyhow::Result<()> {
        let ctx = test_context();
        let pool = BodyPool::new(8, 1 << 20);
        let pts = points(25);
        let mut w = Writer::default();
        w.opts = WriteOptions::new(Category::Metric).batch_size(10);
        w.points = pts.clone();
        let mut sink = CollectSink::default();

        let built = w.build_points_body(&pool, &ctx.metrics, &mut sink).await?;
        assert_eq!(built, 3);
        let sizes: Vec<_> = sink.bodies.iter().map(|b| b.npts()).collect();
        assert_eq!(sizes, vec![Some(10), Some(10), Some(5)]);

        let mut back = Vec::new();
        for b in &sink.bodies {
            assert!(b.gzon(), "gzip is on by default");
            back.extend(point::decode(Encoding::LineProtocol, &raw(b)?)?);
            assert_eq!(b.raw_len(), raw(b)?.len(), "raw_len is the pre-gzip size");
        }
        assert_eq!(back, pts, "every point, once, in order");
        assert_eq!(ctx.metrics.build_batches.with_label_values(&["metric", "line-protocol", "true"]).get(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_no_body_busts_the_byte_limit() -> anyhow::Result<()> {
        let ctx = test_context();
        let pool = BodyPool::new(8, 1 << 20);
        let mut w = Writer::default();
        w.opts = WriteOptions::new(Category::Logging).batch_bytes(200).gzip(false).encoding(Encoding::Json);
        w.points = points(30);
        let mut sink = CollectSink::default();

        w.build_points_body(&pool, &ctx.metrics, &mut sink).await?;
        assert!(sink.bodies.len() > 1);
        let mut total = 0;
        for b in &sink.bodies {
            assert!(b.payload().len() <= 200, "body of {} bytes", b.payload().len());
            total += point::decode(Encoding::Json, b.payload())?.len();
        }
        assert_eq!(total, 30);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_chonky_point_stays_home() -> anyhow::Result<()> {
        let ctx = test_context();
        let pool = BodyPool::new(8, 1 << 20);
        let mut w = Writer::default();
        w.opts = WriteOptions::new(Category::Logging).batch_bytes(64).gzip(false);
        w.points = vec![
            Point::new("log").with_field("msg", "small").with_time(1),
            Point::new("log").with_field("msg", "x".repeat(500)).with_time(2),
            Point::new("log").with_field("msg", "tiny").with_time(3),
        ];
        let mut sink = CollectSink::default();

        w.build_points_body(&pool, &ctx.metrics, &mut sink).await?;
        let sent: usize = sink.bodies.iter().filter_map(Body::npts).sum();
        assert_eq!(sent, 2);
        assert_eq!(ctx.metrics.skipped_points.with_label_values(&["logging"]).get(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_headers_and_flags_ride_along() -> anyhow::Result<()> {
        let ctx = test_context();
        let pool = BodyPool::new(8, 1 << 20);
        let mut w = Writer::default();
        w.opts = WriteOptions::new(Category::DynamicDWCategory)
            .header("X-Global-Tags", "host=a")
            .header("x-global-tags", "host=b")
            .dynamic_url("http://dw/v1/write/x?token=tkn_1")
            .cache_all(true);
        w.points = points(2);
        let mut sink = CollectSink::default();

        w.build_points_body(&pool, &ctx.metrics, &mut sink).await?;
        let b = &sink.bodies[0];
        assert_eq!(b.headers().len(), 1, "header keys are case-insensitive");
        assert_eq!(b.headers()[0].1, "host=b");
        assert_eq!(b.dynamic_url(), Some("http://dw/v1/write/x?token=tkn_1"));
        assert!(b.cache_all());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_grumpy_sink_does_not_stop_the_line() -> anyhow::Result<()> {
        let ctx = test_context();
        let pool = BodyPool::new(8, 1 << 20);
        let mut w = Writer::default();
        w.opts = WriteOptions::new(Category::Tracing).batch_size(1);
        w.points = points(3);
        let mut sink = CollectSink { fail: true, ..Default::default() };

        assert_eq!(w.build_points_body(&pool, &ctx.metrics, &mut sink).await?, 3);
        assert_eq!(ctx.metrics.build_callback_errors.with_label_values(&["tracing"]).get(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_protobuf_is_politely_declined() {
        let ctx = test_context();
        let pool = BodyPool::new(1, 1024);
        let mut w = Writer::default();
        w.opts = WriteOptions::new(Category::Metric).encoding(Encoding::Protobuf);
        w.points = points(1);
        let res = w.build_points_body(&pool, &ctx.metrics, &mut CollectSink::default()).await;
        assert!(res.is_err());
    }

    #[test]
    fn the_one_where_pooled_writers_come_back_clean() {
        let pool = WriterPool::new(2);
        let w = pool.get(WriteOptions::new(Category::Rum).cache_all(true), points(3));
        assert_eq!(w.points().len(), 3);
        pool.release(w);
        assert_eq!(pool.len(), 1);
        let w = pool.get(WriteOptions::new(Category::Logging), Vec::new());
        assert!(w.points().is_empty());
        assert!(!w.options().cache_all);
        assert_eq!(w.options().category, Category::Logging);
    }
}
