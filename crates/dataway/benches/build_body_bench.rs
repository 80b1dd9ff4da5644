//! 🏎️ How fast does a pile of points turn into gzipped bodies?

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use dataway::body::{Body, BodyPool};
use dataway::writer::{BodySink, WriteOptions, WriterPool};
use dataway::{Category, Encoding, Point, RuntimeContext};
use prometheus::Registry;
use tokio::runtime::Runtime;

/// 🗑️ Hands every body straight back to the pool.
struct Recycle {
    pool: Arc<BodyPool>,
}

#[async_trait]
impl BodySink for Recycle {
    async fn on_body(&mut self, _opts: &WriteOptions, body: Body) -> anyhow::Result<()> {
        self.pool.release(body);
        Ok(())
    }
}

fn points(n: usize) -> Vec<Point> {
    (0..n)
        .map(|i| {
            Point::new("nginx")
                .with_tag("host", format!("web-{}", i % 16))
                .with_tag("service", "frontend")
                .with_field("message", format!("GET /api/v1/items/{i} 200 {}ms", i % 250))
                .with_field("status", 200i64)
                .with_time(1_700_000_000_000_000_000 + i as i64)
        })
        .collect()
}

fn bench_build_body(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let ctx = RuntimeContext::new(&Registry::new()).expect("metrics");
    let body_pool = Arc::new(BodyPool::new(64, 16 << 20));
    let writers = WriterPool::new(4);

    let mut group = c.benchmark_group("build_points_body");
    for (enc, gzip) in [(Encoding::LineProtocol, true), (Encoding::LineProtocol, false), (Encoding::Json, true)] {
        for n in [100, 10_000] {
            let input = points(n);
            let id = BenchmarkId::new(format!("{}-gzip-{}", enc, gzip), n);
            group.bench_with_input(id, &input, |b, input| {
                b.to_async(&rt).iter(|| async {
                    let opts = WriteOptions::new(Category::Logging).encoding(enc).gzip(gzip).batch_bytes(1 << 20);
                    let mut w = writers.get(opts, input.clone());
                    let mut sink = Recycle { pool: body_pool.clone() };
                    w.build_points_body(&body_pool, &ctx.metrics, &mut sink).await.expect("build");
                    writers.release(w);
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_build_body);
criterion_main!(benches);
