#![forbid(unsafe_code)]
//! Zone allocator and zone I/O engine for host-managed zoned block devices.
//!
//! The device's zones are inventoried at open into three disjoint pools
//! (op-log, snapshot, io) and served to writers through a lifetime-aware
//! allocator that upholds the device's active/open zone quotas. Reclaim
//! (reset) and eager finish run on a background worker, off the allocation
//! path.
//!
//! ## Ownership protocol
//!
//! The `open_for_write` CAS linearizes write ownership: one foreground
//! writer, or one background reclaim job, holds it at a time. Background
//! jobs additionally hold `bg_processing` from the moment a zone is
//! claimed for reclaim until the reset or finish completes. Quota counters
//! are atomics; writers closing a zone decrement them under the
//! zone-resources lock and wake one parked allocator.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use zbd_device::ZonedBackend;
use zbd_error::{Result, ZbdError};
use zbd_types::{DeviceModel, LifetimeHint, ZoneType};

pub mod metrics;
mod worker;
mod zone;

pub use worker::BackgroundWorker;
pub use zbd_device::OpenMode;
pub use zone::{Zone, ZoneSnapshot, WRITE_COMPLETION_TIMEOUT};

use metrics::{
    names, CounterReporter, GaugeReporter, HistogramReporter, LatencyGuard,
    MetricsReporterFactory, NoopMetricsFactory,
};

/// Zones reserved for the rolling metadata log.
///
/// Two non-offline op-log zones are needed to roll the log safely.
pub const OP_LOG_ZONES: usize = 2;

/// Zones reserved for metadata snapshots.
pub const SNAPSHOT_ZONES: usize = 2;

/// Minimum number of zones that makes sense for this layout.
pub const MIN_ZONES: u64 = 32;

/// Open/active slots held back from the io quota for metadata writing.
const RESERVED_META_SLOTS: i64 = 3;

/// Extra active slot non-WAL allocations leave free, so WAL allocation
/// can always proceed even when WAL files are closed late.
const RESERVED_ZONES: i64 = 1;

const LIFETIME_DIFF_NOT_GOOD: u32 = 100;
const LIFETIME_DIFF_MEH: u32 = 2;

/// How long a blocked allocation parks before rescanning.
const ALLOC_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Distance between a zone's lifetime hint and a file's requested hint.
///
/// Smaller is better. An exact non-trivial match scores 2, so a zone whose
/// hint is one step longer than the request is preferred over an exact
/// match; anything shorter-lived than the request is unusable.
#[must_use]
pub fn lifetime_diff(zone_lifetime: LifetimeHint, file_lifetime: LifetimeHint) -> u32 {
    if matches!(file_lifetime, LifetimeHint::NotSet | LifetimeHint::None) {
        if file_lifetime == zone_lifetime {
            return 0;
        }
        return LIFETIME_DIFF_NOT_GOOD;
    }

    if zone_lifetime == file_lifetime {
        return LIFETIME_DIFF_MEH;
    }
    if zone_lifetime > file_lifetime {
        return u32::from(zone_lifetime.as_u8() - file_lifetime.as_u8());
    }
    LIFETIME_DIFF_NOT_GOOD
}

// ── Zone resource gate ──────────────────────────────────────────────────────

/// Active/open counters plus the wait/notify gate for quota slots.
pub(crate) struct ZoneResources {
    active_io_zones: AtomicI64,
    open_io_zones: AtomicI64,
    mtx: Mutex<()>,
    cv: Condvar,
}

impl ZoneResources {
    pub(crate) fn new() -> Self {
        Self {
            active_io_zones: AtomicI64::new(0),
            open_io_zones: AtomicI64::new(0),
            mtx: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.mtx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn active(&self) -> i64 {
        self.active_io_zones.load(Ordering::Acquire)
    }

    pub(crate) fn open(&self) -> i64 {
        self.open_io_zones.load(Ordering::Acquire)
    }

    /// A writer released its open slot.
    pub(crate) fn notify_io_zone_closed(&self) {
        self.open_io_zones.fetch_sub(1, Ordering::AcqRel);
        self.cv.notify_one();
    }

    /// A zone left the active set (became Full or was reset).
    pub(crate) fn notify_io_zone_full(&self) {
        self.active_io_zones.fetch_sub(1, Ordering::AcqRel);
        self.cv.notify_one();
    }

    fn decrement_active(&self) {
        self.active_io_zones.fetch_sub(1, Ordering::AcqRel);
    }

    fn increment_open(&self) {
        self.open_io_zones.fetch_add(1, Ordering::AcqRel);
    }

    fn try_increment_active(&self, expected: i64) -> bool {
        self.active_io_zones
            .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn wake(&self) {
        self.cv.notify_one();
    }

    fn park(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .cv
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

// ── Options and metrics wiring ──────────────────────────────────────────────

/// Tunables for [`ZonedBlockDevice::open_with`].
#[derive(Clone)]
pub struct EngineOptions {
    /// Zones with less than this percentage of capacity remaining are
    /// finished eagerly during non-WAL allocation. Zero disables it.
    pub finish_threshold_percent: u64,
    pub metrics: Arc<dyn MetricsReporterFactory>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            finish_threshold_percent: 0,
            metrics: Arc::new(NoopMetricsFactory),
        }
    }
}

struct EngineMetrics {
    write_latency: Arc<dyn HistogramReporter>,
    fg_sync_latency: Arc<dyn HistogramReporter>,
    bg_sync_latency: Arc<dyn HistogramReporter>,
    meta_alloc_latency: Arc<dyn HistogramReporter>,
    io_alloc_wal_latency: Arc<dyn HistogramReporter>,
    io_alloc_non_wal_latency: Arc<dyn HistogramReporter>,

    write_qps: Arc<dyn CounterReporter>,
    sync_qps: Arc<dyn CounterReporter>,
    io_alloc_qps: Arc<dyn CounterReporter>,
    meta_alloc_qps: Arc<dyn CounterReporter>,

    active_zones: Arc<dyn GaugeReporter>,
    open_zones: Arc<dyn GaugeReporter>,
    free_space: Arc<dyn GaugeReporter>,
    used_space: Arc<dyn GaugeReporter>,
    reclaimable_space: Arc<dyn GaugeReporter>,
}

impl EngineMetrics {
    fn new(factory: &dyn MetricsReporterFactory) -> Self {
        Self {
            write_latency: factory.histogram(names::WRITE_LATENCY),
            fg_sync_latency: factory.histogram(names::FG_SYNC_LATENCY),
            bg_sync_latency: factory.histogram(names::BG_SYNC_LATENCY),
            meta_alloc_latency: factory.histogram(names::META_ALLOC_LATENCY),
            io_alloc_wal_latency: factory.histogram(names::IO_ALLOC_WAL_LATENCY),
            io_alloc_non_wal_latency: factory.histogram(names::IO_ALLOC_NON_WAL_LATENCY),
            write_qps: factory.counter(names::WRITE_QPS),
            sync_qps: factory.counter(names::SYNC_QPS),
            io_alloc_qps: factory.counter(names::IO_ALLOC_QPS),
            meta_alloc_qps: factory.counter(names::META_ALLOC_QPS),
            active_zones: factory.gauge(names::ACTIVE_ZONES),
            open_zones: factory.gauge(names::OPEN_ZONES),
            free_space: factory.gauge(names::FREE_SPACE),
            used_space: factory.gauge(names::USED_SPACE),
            reclaimable_space: factory.gauge(names::RECLAIMABLE_SPACE),
        }
    }
}

fn gauge_value(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

// ── Reporting types ─────────────────────────────────────────────────────────

/// Per-zone figures for the operational stat surface.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStat {
    pub total_capacity: u64,
    pub write_position: u64,
    pub start_position: u64,
}

/// JSON shape of the whole device for operational tools.
#[derive(Debug, Serialize)]
pub struct DeviceSnapshot {
    pub meta: Vec<ZoneSnapshot>,
    #[serde(rename = "meta snapshot")]
    pub meta_snapshot: Vec<ZoneSnapshot>,
    pub io: Vec<ZoneSnapshot>,
}

// ── Device facade ───────────────────────────────────────────────────────────

/// A zoned block device with its zone pools, allocator, and workers.
pub struct ZonedBlockDevice {
    backend: Arc<dyn ZonedBackend>,
    resources: Arc<ZoneResources>,

    block_size: u32,
    zone_size: u64,
    nr_zones: u64,
    max_active_io_zones: i64,
    max_open_io_zones: i64,
    finish_threshold_percent: u64,

    op_zones: Vec<Arc<Zone>>,
    snapshot_zones: Vec<Arc<Zone>>,
    io_zones: Vec<Arc<Zone>>,

    data_worker: BackgroundWorker,
    meta_worker: BackgroundWorker,

    metrics: EngineMetrics,
    start_time: Instant,
}

impl std::fmt::Debug for ZonedBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonedBlockDevice")
            .field("path", &self.backend.path())
            .field("nr_zones", &self.nr_zones)
            .field("io_zones", &self.io_zones.len())
            .field("max_active_io_zones", &self.max_active_io_zones)
            .field("max_open_io_zones", &self.max_open_io_zones)
            .finish_non_exhaustive()
    }
}

impl ZonedBlockDevice {
    /// Open with default options.
    pub fn open(backend: Arc<dyn ZonedBackend>, mode: OpenMode) -> Result<Self> {
        Self::open_with(backend, mode, EngineOptions::default())
    }

    /// Inventory the device and build the zone pools.
    ///
    /// Refuses devices that are not host-managed or have fewer than
    /// [`MIN_ZONES`] zones, and devices whose I/O scheduler would reorder
    /// sequential writes. Zones the device reports open in the io pool are
    /// closed (unless opened read-only) so the initial active count is
    /// trustworthy.
    pub fn open_with(
        backend: Arc<dyn ZonedBackend>,
        mode: OpenMode,
        opts: EngineOptions,
    ) -> Result<Self> {
        let geometry = backend.geometry();

        if geometry.model != DeviceModel::HostManaged {
            return Err(ZbdError::NotSupported(format!(
                "{} is not a host-managed block device",
                backend.path()
            )));
        }
        if geometry.nr_zones < MIN_ZONES {
            return Err(ZbdError::NotSupported(format!(
                "too few zones on {} ({} required, {} reported)",
                backend.path(),
                MIN_ZONES,
                geometry.nr_zones
            )));
        }
        backend.check_scheduler()?;

        let block_size = geometry.block_size.get();
        let resources = Arc::new(ZoneResources::new());
        // Three slots stay reserved for metadata writing.
        let max_active_io_zones = i64::from(geometry.max_active_zones) - RESERVED_META_SLOTS;
        let max_open_io_zones = i64::from(geometry.max_open_zones) - RESERVED_META_SLOTS;

        let report = backend.report_zones(0, geometry.total_bytes())?;
        let mut rows = report.iter();

        let make_zone = |desc: &zbd_types::ZoneDescriptor| {
            Arc::new(Zone::new(
                Arc::clone(&backend),
                Arc::clone(&resources),
                desc,
                block_size,
            ))
        };

        // Metadata pools consume the first sequential-write-required report
        // slots, offline or not; only non-offline zones become usable.
        let mut op_zones = Vec::new();
        let mut taken = 0;
        while taken < OP_LOG_ZONES {
            let Some(desc) = rows.next() else { break };
            if desc.zone_type == ZoneType::SequentialWriteRequired {
                if desc.condition != zbd_types::ZoneCondition::Offline {
                    op_zones.push(make_zone(desc));
                }
                taken += 1;
            }
        }

        let mut snapshot_zones = Vec::new();
        let mut taken = 0;
        while taken < SNAPSHOT_ZONES {
            let Some(desc) = rows.next() else { break };
            if desc.zone_type == ZoneType::SequentialWriteRequired {
                if desc.condition != zbd_types::ZoneCondition::Offline {
                    snapshot_zones.push(make_zone(desc));
                }
                taken += 1;
            }
        }

        let mut io_zones = Vec::new();
        let mut initial_active: i64 = 0;
        for desc in rows {
            if desc.zone_type != ZoneType::SequentialWriteRequired
                || desc.condition == zbd_types::ZoneCondition::Offline
            {
                continue;
            }
            let zone = make_zone(desc);
            if desc.condition.is_active() {
                initial_active += 1;
                if desc.condition.is_open() && !mode.is_read_only() {
                    if let Err(err) = zone.close() {
                        warn!(
                            target: "zbdfs::alloc",
                            event = "initial_close_failed",
                            zone = %zone.zone_nr(),
                            error = %err
                        );
                    }
                }
            }
            io_zones.push(zone);
        }
        resources
            .active_io_zones
            .store(initial_active, Ordering::Release);

        info!(
            target: "zbdfs::alloc",
            event = "device_inventoried",
            path = backend.path(),
            nr_zones = geometry.nr_zones,
            op_zones = op_zones.len(),
            snapshot_zones = snapshot_zones.len(),
            io_zones = io_zones.len(),
            initial_active,
            max_active_io_zones,
            max_open_io_zones
        );

        Ok(Self {
            block_size,
            zone_size: geometry.zone_size,
            nr_zones: geometry.nr_zones,
            max_active_io_zones,
            max_open_io_zones,
            finish_threshold_percent: opts.finish_threshold_percent,
            op_zones,
            snapshot_zones,
            io_zones,
            data_worker: BackgroundWorker::new("zbd-data-worker")?,
            meta_worker: BackgroundWorker::new("zbd-meta-worker")?,
            metrics: EngineMetrics::new(opts.metrics.as_ref()),
            start_time: Instant::now(),
            backend,
            resources,
        })
    }

    // ── Geometry accessors ─────────────────────────────────────────────────

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    #[must_use]
    pub fn nr_zones(&self) -> u64 {
        self.nr_zones
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.backend.path()
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ZonedBackend> {
        &self.backend
    }

    #[must_use]
    pub fn max_active_io_zones(&self) -> i64 {
        self.max_active_io_zones
    }

    #[must_use]
    pub fn max_open_io_zones(&self) -> i64 {
        self.max_open_io_zones
    }

    #[must_use]
    pub fn active_io_zones(&self) -> i64 {
        self.resources.active()
    }

    #[must_use]
    pub fn open_io_zones(&self) -> i64 {
        self.resources.open()
    }

    // ── Pool accessors ─────────────────────────────────────────────────────

    #[must_use]
    pub fn op_zones(&self) -> &[Arc<Zone>] {
        &self.op_zones
    }

    #[must_use]
    pub fn snapshot_zones(&self) -> &[Arc<Zone>] {
        &self.snapshot_zones
    }

    #[must_use]
    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    /// The io zone whose range contains `offset`.
    #[must_use]
    pub fn get_io_zone(&self, offset: u64) -> Option<Arc<Zone>> {
        self.io_zones
            .iter()
            .find(|z| z.start() <= offset && offset < z.start() + self.zone_size)
            .cloned()
    }

    /// The meta worker, for metadata roll/flush jobs of the layer above.
    #[must_use]
    pub fn meta_worker(&self) -> &BackgroundWorker {
        &self.meta_worker
    }

    // ── Metadata allocation ────────────────────────────────────────────────

    /// First empty op-log zone, if any. The caller coordinates ownership.
    #[must_use]
    pub fn allocate_meta_zone(&self) -> Option<Arc<Zone>> {
        let _guard = LatencyGuard::new(Arc::clone(&self.metrics.meta_alloc_latency));
        self.metrics.meta_alloc_qps.add(1);
        self.op_zones.iter().find(|z| z.is_empty()).cloned()
    }

    /// First empty snapshot zone, if any.
    #[must_use]
    pub fn allocate_snapshot_zone(&self) -> Option<Arc<Zone>> {
        let _guard = LatencyGuard::new(Arc::clone(&self.metrics.meta_alloc_latency));
        self.metrics.meta_alloc_qps.add(1);
        self.snapshot_zones.iter().find(|z| z.is_empty()).cloned()
    }

    // ── Data allocation ────────────────────────────────────────────────────

    /// Allocate an io zone for writing, blocking until one is available.
    ///
    /// WAL allocations may use the full active quota; other allocations
    /// leave one slot free for them. The returned zone has
    /// `open_for_write` set and must be released with
    /// [`Zone::close_write`].
    pub fn allocate_zone(&self, file_lifetime: LifetimeHint, is_wal: bool) -> Arc<Zone> {
        let hist = if is_wal {
            &self.metrics.io_alloc_wal_latency
        } else {
            &self.metrics.io_alloc_non_wal_latency
        };
        let _guard = LatencyGuard::new(Arc::clone(hist));
        self.metrics.io_alloc_qps.add(1);

        loop {
            if let Some(zone) = self.allocate_pass(file_lifetime, is_wal) {
                self.finish_allocation(&zone, file_lifetime, is_wal);
                return zone;
            }
            // Park until a writer closes, a background job reclaims,
            // or the bounded wait elapses; then rescan.
            self.resources.park(ALLOC_RETRY_WAIT);
        }
    }

    /// One non-blocking allocation pass.
    #[must_use]
    pub fn try_allocate_zone(
        &self,
        file_lifetime: LifetimeHint,
        is_wal: bool,
    ) -> Option<Arc<Zone>> {
        self.metrics.io_alloc_qps.add(1);
        let zone = self.allocate_pass(file_lifetime, is_wal)?;
        self.finish_allocation(&zone, file_lifetime, is_wal);
        Some(zone)
    }

    fn allocate_pass(&self, file_lifetime: LifetimeHint, is_wal: bool) -> Option<Arc<Zone>> {
        // Open quota gates every path: reused zones do not pass the active
        // check below, so the cap must be enforced here.
        if self.resources.open() >= self.max_open_io_zones {
            return None;
        }

        self.reclaim_pass(is_wal);

        // Try to extend an already written zone with the closest lifetime.
        let mut best: Option<&Arc<Zone>> = None;
        let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
        for z in &self.io_zones {
            if z.bg_processing.load(Ordering::Acquire) {
                continue;
            }
            if !z.is_open_for_write() && z.used_capacity() > 0 && !z.is_full() {
                let diff = lifetime_diff(z.lifetime(), file_lifetime);
                if diff < best_diff {
                    best = Some(z);
                    best_diff = diff;
                }
            }
        }
        if let Some(z) = best {
            if z
                .open_for_write
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.resources.increment_open();
                return Some(Arc::clone(z));
            }
            // Lost the race; fall through to the empty-zone pass.
        }

        // No good match: open an empty zone, if the active quota allows.
        let reserved = if is_wal { 0 } else { RESERVED_ZONES };
        if self.resources.active() < self.max_active_io_zones - reserved {
            for z in &self.io_zones {
                if z.bg_processing.load(Ordering::Acquire) {
                    continue;
                }
                if z.is_open_for_write() || !z.is_empty() {
                    continue;
                }
                if z
                    .open_for_write
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }
                z.set_lifetime(file_lifetime);

                // The active count may have moved since the check above;
                // publish the new zone only if the quota still holds.
                loop {
                    let active = self.resources.active();
                    if active >= self.max_active_io_zones - reserved {
                        z.open_for_write.store(false, Ordering::Release);
                        return None;
                    }
                    if self.resources.try_increment_active(active) {
                        self.resources.increment_open();
                        return Some(Arc::clone(z));
                    }
                }
            }
        }

        None
    }

    /// Reset unused zones and finish used zones under the capacity
    /// threshold, in the background.
    ///
    /// A background job holds `bg_processing` for its whole lifetime and
    /// additionally takes `open_for_write` for the duration of the reset or
    /// finish, so no writer can be handed the zone mid-operation. The write
    /// ownership is taken with a CAS: a foreground allocation that slipped
    /// past the scan wins, and the job is not submitted.
    fn reclaim_pass(&self, is_wal: bool) {
        for z in &self.io_zones {
            if z.is_open_for_write() || z.is_empty() || (z.is_full() && z.is_used()) {
                continue;
            }
            if z
                .bg_processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            if z.used_capacity() <= 0 {
                // No live data: reset off the allocation path.
                if z
                    .open_for_write
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    z.bg_processing.store(false, Ordering::SeqCst);
                    continue;
                }
                let zone = Arc::clone(z);
                let resources = Arc::clone(&self.resources);
                self.data_worker.submit(move || {
                    let was_active = !zone.is_full();
                    if let Err(err) = zone.reset() {
                        warn!(
                            target: "zbdfs::alloc",
                            event = "background_reset_failed",
                            zone = %zone.zone_nr(),
                            error = %err
                        );
                    }
                    if was_active {
                        resources.decrement_active();
                    }
                    zone.open_for_write.store(false, Ordering::SeqCst);
                    zone.bg_processing.store(false, Ordering::SeqCst);
                    resources.wake();
                });
                continue;
            }

            // Finishing an almost-full zone costs little and frees an
            // active slot.
            if !is_wal
                && z.capacity_left()
                    < z.max_capacity() * self.finish_threshold_percent / 100
            {
                if z
                    .open_for_write
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    z.bg_processing.store(false, Ordering::SeqCst);
                    continue;
                }
                let zone = Arc::clone(z);
                let resources = Arc::clone(&self.resources);
                self.data_worker.submit(move || {
                    if let Err(err) = zone.finish() {
                        warn!(
                            target: "zbdfs::alloc",
                            event = "background_finish_failed",
                            zone = %zone.zone_nr(),
                            error = %err
                        );
                    }
                    resources.decrement_active();
                    zone.open_for_write.store(false, Ordering::SeqCst);
                    zone.bg_processing.store(false, Ordering::SeqCst);
                    resources.wake();
                });
                continue;
            }

            z.bg_processing.store(false, Ordering::SeqCst);
        }
    }

    fn finish_allocation(&self, zone: &Zone, file_lifetime: LifetimeHint, is_wal: bool) {
        debug!(
            target: "zbdfs::alloc",
            event = "zone_allocated",
            zone = %zone.zone_nr(),
            start = zone.start(),
            wp = zone.wp(),
            zone_lifetime = ?zone.lifetime(),
            file_lifetime = ?file_lifetime,
            is_wal,
            active = self.resources.active(),
            open = self.resources.open()
        );
        self.log_zone_stats();
        self.metrics
            .active_zones
            .set(gauge_value(self.resources.active()));
        self.metrics
            .open_zones
            .set(gauge_value(self.resources.open()));
    }

    /// Reset every io zone with no live data. Frees active slots for zones
    /// that were not Full.
    pub fn reset_unused_io_zones(&self) {
        let _guard = self.resources.lock();
        for z in &self.io_zones {
            // Zones owned by a background job are already being reclaimed.
            if z.bg_processing.load(Ordering::SeqCst) {
                continue;
            }
            if !z.is_used() && !z.is_empty() {
                if !z.is_full() {
                    self.resources.decrement_active();
                }
                if let Err(err) = z.reset() {
                    warn!(
                        target: "zbdfs::alloc",
                        event = "unused_zone_reset_failed",
                        zone = %z.zone_nr(),
                        error = %err
                    );
                }
            }
        }
    }

    // ── Space accounting ───────────────────────────────────────────────────

    /// Unwritten capacity across the io pool.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity_left()).sum()
    }

    /// Live bytes declared by the layer above across the io pool.
    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.io_zones
            .iter()
            .map(|z| u64::try_from(z.used_capacity()).unwrap_or(0))
            .sum()
    }

    /// Dead bytes in Full io zones, recoverable by reset.
    #[must_use]
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| {
                z.max_capacity()
                    .saturating_sub(u64::try_from(z.used_capacity()).unwrap_or(0))
            })
            .sum()
    }

    /// Log space figures and push the space gauges.
    pub fn report_space_utilization(&self) {
        const GB: u64 = 1024 * 1024 * 1024;
        let free = self.free_space();
        let used = self.used_space();
        let reclaimable = self.reclaimable_space();
        info!(
            target: "zbdfs::alloc",
            event = "space_utilization",
            free_gb = free / GB,
            used_gb = used / GB,
            reclaimable_gb = reclaimable / GB
        );
        self.metrics.free_space.set(free / GB);
        self.metrics.used_space.set(used / GB);
        self.metrics.reclaimable_space.set(reclaimable / GB);
    }

    /// Per-zone capacity/position figures over the io pool.
    #[must_use]
    pub fn get_stat(&self) -> Vec<ZoneStat> {
        self.io_zones
            .iter()
            .map(|z| ZoneStat {
                total_capacity: z.max_capacity(),
                write_position: z.wp(),
                start_position: z.start(),
            })
            .collect()
    }

    /// Aggregate zone statistics, at debug level.
    pub fn log_zone_stats(&self) {
        let mut used_capacity = 0_u64;
        let mut reclaimable_capacity = 0_u64;
        let mut reclaimables_max_capacity = 0_u64;
        let mut partial = 0_u64;

        for z in &self.io_zones {
            let used = u64::try_from(z.used_capacity()).unwrap_or(0);
            used_capacity += used;
            if used > 0 {
                reclaimable_capacity += z.max_capacity().saturating_sub(used);
                reclaimables_max_capacity += z.max_capacity();
            }
            if !(z.is_full() || z.is_empty()) {
                partial += 1;
            }
        }
        if reclaimables_max_capacity == 0 {
            reclaimables_max_capacity = 1;
        }

        const MB: u64 = 1024 * 1024;
        debug!(
            target: "zbdfs::alloc",
            event = "zone_stats",
            uptime_s = self.start_time.elapsed().as_secs(),
            used_cap_mb = used_capacity / MB,
            reclaimable_cap_mb = reclaimable_capacity / MB,
            avg_reclaimable_pct = 100 * reclaimable_capacity / reclaimables_max_capacity,
            partial_zones = partial,
            active_zones = self.resources.active(),
            open_zones = self.resources.open()
        );
    }

    /// Per-zone live byte counts, at debug level.
    pub fn log_zone_usage(&self) {
        for z in &self.io_zones {
            let used = z.used_capacity();
            if used > 0 {
                const MB: i64 = 1024 * 1024;
                debug!(
                    target: "zbdfs::alloc",
                    event = "zone_usage",
                    start = z.start(),
                    used_bytes = used,
                    used_mb = used / MB
                );
            }
        }
    }

    // ── Snapshots ──────────────────────────────────────────────────────────

    /// Snapshot of every pool for the operational JSON surface.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        let collect = |zones: &[Arc<Zone>]| zones.iter().map(|z| z.snapshot()).collect();
        DeviceSnapshot {
            meta: collect(&self.op_zones),
            meta_snapshot: collect(&self.snapshot_zones),
            io: collect(&self.io_zones),
        }
    }

    // ── Reporter handoff for the file layer ────────────────────────────────

    #[must_use]
    pub fn write_latency_reporter(&self) -> Arc<dyn HistogramReporter> {
        Arc::clone(&self.metrics.write_latency)
    }

    #[must_use]
    pub fn fg_sync_latency_reporter(&self) -> Arc<dyn HistogramReporter> {
        Arc::clone(&self.metrics.fg_sync_latency)
    }

    #[must_use]
    pub fn bg_sync_latency_reporter(&self) -> Arc<dyn HistogramReporter> {
        Arc::clone(&self.metrics.bg_sync_latency)
    }

    #[must_use]
    pub fn write_qps_reporter(&self) -> Arc<dyn CounterReporter> {
        Arc::clone(&self.metrics.write_qps)
    }

    #[must_use]
    pub fn sync_qps_reporter(&self) -> Arc<dyn CounterReporter> {
        Arc::clone(&self.metrics.sync_qps)
    }
}
