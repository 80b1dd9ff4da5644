//! 📈 Metrics — every counter the egress path bumps, registered on a caller-owned registry.
//!
//! 🧠 Knowledge graph: `Metrics::new(&Registry)` is called once per runtime context.
//! Tests hand in a fresh `Registry` each, so two tests never fight over the same counter.
//! The CLI gathers the same registry to print its summary table.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

const NS: &str = "dataway";

/// 📊 The full metric set. Cheap to clone (every vec is an `Arc` inside).
#[derive(Debug, Clone)]
pub struct Metrics {
    /// `{api, status}`
    pub api_latency: HistogramVec,
    /// `{api, status}`
    pub api_retry: IntCounterVec,
    /// `{category, enc, status}`, enc is `gzip` or `raw`
    pub bytes: IntCounterVec,
    /// `{category, status}`
    pub points: IntCounterVec,
    /// `{category, encoding, gzip}`
    pub build_cost: HistogramVec,
    pub build_bytes: HistogramVec,
    pub build_points: HistogramVec,
    pub build_batches: IntCounterVec,
    /// `{category}`
    pub build_callback_errors: IntCounterVec,
    /// `{category}`
    pub skipped_points: IntCounterVec,
    /// `{category}`
    pub group_count: HistogramVec,
    /// `{category}`
    pub wal_mem_len: IntGaugeVec,
    /// `{category, from}`
    pub wal_points: IntCounterVec,
    /// `{category}`
    pub wal_put_retried: IntCounterVec,
    /// `{category, reason}`
    pub wal_dropped: IntCounterVec,
    /// `{category, op}`, op is `put` or `get`
    pub wal_disk_bytes: IntCounterVec,
    /// `{category, reason}`
    pub flush_dropped: IntCounterVec,
    /// `{category, result}`
    pub fail_cache: IntCounterVec,
    pub flush_latency: Histogram,
    /// unix seconds of the last "beyond data usage" answer; 0 when clear
    pub beyond_usage: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help).namespace(NS), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> prometheus::Result<HistogramVec> {
    let h = HistogramVec::new(HistogramOpts::new(name, help).namespace(NS).buckets(buckets), labels)?;
    registry.register(Box::new(h.clone()))?;
    Ok(h)
}

impl Metrics {
    /// 🏗️ Builds and registers everything. Fails if the registry already has these names.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let latency_buckets = prometheus::exponential_buckets(0.005, 2.0, 12)?;
        let size_buckets = prometheus::exponential_buckets(256.0, 4.0, 10)?;
        let count_buckets = prometheus::exponential_buckets(1.0, 4.0, 10)?;

        let wal_mem_len = IntGaugeVec::new(
            Opts::new("wal_mem_len", "Bodies currently parked in the WAL memory channel").namespace(NS),
            &["category"],
        )?;
        registry.register(Box::new(wal_mem_len.clone()))?;

        let flush_latency = Histogram::with_opts(
            HistogramOpts::new("flush_latency_seconds", "Time to deliver one body to every endpoint")
                .namespace(NS)
                .buckets(latency_buckets.clone()),
        )?;
        registry.register(Box::new(flush_latency.clone()))?;

        let beyond_usage = IntGauge::with_opts(
            Opts::new("beyond_usage", "Unix time the upstream last reported the workspace over quota").namespace(NS),
        )?;
        registry.register(Box::new(beyond_usage.clone()))?;

        Ok(Self {
            api_latency: histogram(
                registry,
                "api_latency_seconds",
                "Dataway API request latency",
                &["api", "status"],
                latency_buckets,
            )?,
            api_retry: counter(registry, "api_retry_total", "Dataway API retries", &["api", "status"])?,
            bytes: counter(registry, "bytes_total", "Bytes sent to dataway", &["category", "enc", "status"])?,
            points: counter(registry, "point_total", "Points sent to dataway", &["category", "status"])?,
            build_cost: histogram(
                registry,
                "build_body_cost_seconds",
                "Time spent encoding and compressing one body",
                &["category", "encoding", "gzip"],
                prometheus::exponential_buckets(0.0001, 4.0, 10)?,
            )?,
            build_bytes: histogram(
                registry,
                "build_body_bytes",
                "Raw bytes per built body",
                &["category", "encoding", "gzip"],
                size_buckets,
            )?,
            build_points: histogram(
                registry,
                "build_body_points",
                "Points per built body",
                &["category", "encoding", "gzip"],
                count_buckets.clone(),
            )?,
            build_batches: counter(
                registry,
                "build_body_batch_total",
                "Bodies built",
                &["category", "encoding", "gzip"],
            )?,
            build_callback_errors: counter(
                registry,
                "build_body_callback_error_total",
                "Bodies the downstream callback refused",
                &["category"],
            )?,
            skipped_points: counter(
                registry,
                "skipped_point_total",
                "Points larger than the body size limit",
                &["category"],
            )?,
            group_count: histogram(
                registry,
                "sink_group_count",
                "Groups produced per grouped write",
                &["category"],
                count_buckets,
            )?,
            wal_mem_len,
            wal_points: counter(registry, "wal_point_total", "Bodies fetched from the WAL", &["category", "from"])?,
            wal_put_retried: counter(
                registry,
                "wal_put_retried_total",
                "WAL puts retried because the disk tier was full",
                &["category"],
            )?,
            wal_dropped: counter(registry, "wal_dropped_total", "Bodies the WAL gave up on", &["category", "reason"])?,
            wal_disk_bytes: counter(registry, "wal_disk_bytes_total", "WAL disk traffic", &["category", "op"])?,
            flush_dropped: counter(
                registry,
                "flush_dropped_total",
                "Bodies dropped by flushers",
                &["category", "reason"],
            )?,
            fail_cache: counter(registry, "fail_cache_total", "Fail-cache traffic", &["category", "result"])?,
            flush_latency,
            beyond_usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_two_registries_do_not_collide() -> anyhow::Result<()> {
        let (a, b) = (Registry::new(), Registry::new());
        let ma = Metrics::new(&a)?;
        let _mb = Metrics::new(&b)?;
        ma.points.with_label_values(&["logging", "OK"]).inc();
        assert!(a.gather().iter().any(|f| f.get_name() == "dataway_point_total"));
        assert!(Metrics::new(&a).is_err(), "same names twice on one registry should be refused");
        Ok(())
    }
}
