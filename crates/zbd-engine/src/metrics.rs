//! Metrics reporter seam.
//!
//! The engine records allocation latencies, operation counts, and zone/space
//! gauges through these interfaces; the transport behind them belongs to
//! the embedding system. [`NoopMetricsFactory`] is the default.

use std::sync::Arc;
use std::time::Instant;

/// Latency histogram, in microseconds.
pub trait HistogramReporter: Send + Sync {
    fn record(&self, value: u64);
}

/// Monotonic event counter.
pub trait CounterReporter: Send + Sync {
    fn add(&self, delta: u64);
}

/// Point-in-time gauge.
pub trait GaugeReporter: Send + Sync {
    fn set(&self, value: u64);
}

/// Builds named reporters once, at device open.
pub trait MetricsReporterFactory: Send + Sync {
    fn histogram(&self, name: &'static str) -> Arc<dyn HistogramReporter>;
    fn counter(&self, name: &'static str) -> Arc<dyn CounterReporter>;
    fn gauge(&self, name: &'static str) -> Arc<dyn GaugeReporter>;
}

/// Metric names the engine reports under.
pub mod names {
    pub const WRITE_LATENCY: &str = "zbdfs_write_latency";
    pub const FG_SYNC_LATENCY: &str = "zbdfs_fg_sync_latency";
    pub const BG_SYNC_LATENCY: &str = "zbdfs_bg_sync_latency";
    pub const META_ALLOC_LATENCY: &str = "zbdfs_meta_alloc_latency";
    pub const IO_ALLOC_WAL_LATENCY: &str = "zbdfs_io_alloc_wal_latency";
    pub const IO_ALLOC_NON_WAL_LATENCY: &str = "zbdfs_io_alloc_non_wal_latency";

    pub const WRITE_QPS: &str = "zbdfs_write_qps";
    pub const SYNC_QPS: &str = "zbdfs_sync_qps";
    pub const IO_ALLOC_QPS: &str = "zbdfs_io_alloc_qps";
    pub const META_ALLOC_QPS: &str = "zbdfs_meta_alloc_qps";

    pub const ACTIVE_ZONES: &str = "zbdfs_active_zones";
    pub const OPEN_ZONES: &str = "zbdfs_open_zones";
    pub const FREE_SPACE: &str = "zbdfs_free_space";
    pub const USED_SPACE: &str = "zbdfs_used_space";
    pub const RECLAIMABLE_SPACE: &str = "zbdfs_reclaimable_space";
}

// ── No-op implementation ────────────────────────────────────────────────────

struct NoopReporter;

impl HistogramReporter for NoopReporter {
    fn record(&self, _value: u64) {}
}

impl CounterReporter for NoopReporter {
    fn add(&self, _delta: u64) {}
}

impl GaugeReporter for NoopReporter {
    fn set(&self, _value: u64) {}
}

/// Factory that discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsFactory;

impl MetricsReporterFactory for NoopMetricsFactory {
    fn histogram(&self, _name: &'static str) -> Arc<dyn HistogramReporter> {
        Arc::new(NoopReporter)
    }

    fn counter(&self, _name: &'static str) -> Arc<dyn CounterReporter> {
        Arc::new(NoopReporter)
    }

    fn gauge(&self, _name: &'static str) -> Arc<dyn GaugeReporter> {
        Arc::new(NoopReporter)
    }
}

/// Records elapsed microseconds into a histogram when dropped.
pub struct LatencyGuard {
    hist: Arc<dyn HistogramReporter>,
    begin: Instant,
}

impl LatencyGuard {
    #[must_use]
    pub fn new(hist: Arc<dyn HistogramReporter>) -> Self {
        Self {
            hist,
            begin: Instant::now(),
        }
    }
}

impl Drop for LatencyGuard {
    fn drop(&mut self) {
        let micros = u64::try_from(self.begin.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.hist.record(micros);
    }
}
