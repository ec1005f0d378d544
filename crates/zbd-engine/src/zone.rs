//! Per-zone runtime state and the append/sync/reset/finish state machine.
//!
//! A [`Zone`] is shared by reference between foreground writers, the
//! allocator, and background reclaim jobs. Mutual exclusion is not a lock:
//! the `open_for_write` CAS admits exactly one owner, and a background
//! job holds it (together with `bg_processing`) for the duration of a
//! reset or finish, so no writer can take the zone mid-operation. All
//! counters are atomics so the accessors stay wait-free.
//!
//! The asynchronous write slot holds at most one submission. It is serviced
//! by a per-zone I/O thread, spawned on first use, that drives the
//! backend's positional write; `sync` reaps the completion with a bounded
//! wait. On a short completion the shadow write pointer stays at its
//! optimistically advanced value: the device write pointer advanced by an
//! unknown prefix, so rewinding would only guarantee the next append fails.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;
use zbd_device::ZonedBackend;
use zbd_error::{Result, ZbdError};
use zbd_types::{LifetimeHint, ZoneCondition, ZoneDescriptor, ZoneNumber};

use crate::ZoneResources;

/// How long `sync` waits for an in-flight write to complete.
pub const WRITE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(1);

/// One zone of the device, with its runtime write state.
pub struct Zone {
    backend: Arc<dyn ZonedBackend>,
    resources: Arc<ZoneResources>,
    start: u64,
    zone_size: u64,
    block_size: u32,
    max_capacity: AtomicU64,
    wp: AtomicU64,
    capacity: AtomicU64,
    /// Live bytes declared by the layer above; the engine only reads it.
    used_capacity: AtomicI64,
    lifetime: AtomicU8,
    pub(crate) open_for_write: AtomicBool,
    pub(crate) bg_processing: AtomicBool,
    wr: Mutex<WriteContext>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("start", &self.start)
            .field("wp", &self.wp.load(Ordering::Relaxed))
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("open_for_write", &self.open_for_write.load(Ordering::Relaxed))
            .field("bg_processing", &self.bg_processing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// JSON shape consumed by the operational tools.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub start: u64,
    pub capacity: u64,
    pub max_capacity: u64,
    pub wp: u64,
    pub lifetime: u8,
    pub used_capacity: i64,
}

impl Zone {
    pub(crate) fn new(
        backend: Arc<dyn ZonedBackend>,
        resources: Arc<ZoneResources>,
        desc: &ZoneDescriptor,
        block_size: u32,
    ) -> Self {
        Self {
            start: desc.start,
            zone_size: desc.zone_size,
            block_size,
            max_capacity: AtomicU64::new(desc.max_capacity),
            wp: AtomicU64::new(desc.wp),
            capacity: AtomicU64::new(desc.capacity_remaining()),
            used_capacity: AtomicI64::new(0),
            lifetime: AtomicU8::new(LifetimeHint::NotSet.as_u8()),
            open_for_write: AtomicBool::new(false),
            bg_processing: AtomicBool::new(false),
            wr: Mutex::new(WriteContext::new()),
            backend,
            resources,
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    #[must_use]
    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity_left(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn zone_nr(&self) -> ZoneNumber {
        ZoneNumber(self.start / self.zone_size)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.capacity_left() == 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    /// Holds live data, or is owned by a writer.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used_capacity.load(Ordering::Acquire) > 0
            || self.open_for_write.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_open_for_write(&self) -> bool {
        self.open_for_write.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn lifetime(&self) -> LifetimeHint {
        LifetimeHint::from_u8(self.lifetime.load(Ordering::Acquire))
    }

    pub(crate) fn set_lifetime(&self, hint: LifetimeHint) {
        self.lifetime.store(hint.as_u8(), Ordering::Release);
    }

    #[must_use]
    pub fn used_capacity(&self) -> i64 {
        self.used_capacity.load(Ordering::Acquire)
    }

    /// Adjust the live-byte count. Called by the extent layer above.
    pub fn add_used_capacity(&self, delta: i64) {
        self.used_capacity.fetch_add(delta, Ordering::AcqRel);
    }

    #[must_use]
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            capacity: self.capacity_left(),
            max_capacity: self.max_capacity(),
            wp: self.wp(),
            lifetime: self.lifetime().as_u8(),
            used_capacity: self.used_capacity(),
        }
    }

    // ── Write path ─────────────────────────────────────────────────────────

    /// Synchronous append at the write pointer.
    ///
    /// `data.len()` must be a whole number of blocks; the caller holds the
    /// write ownership flag. Short device writes are retried until the full
    /// buffer is on media.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        debug_assert_eq!(size % u64::from(self.block_size), 0, "unaligned append");

        if self.capacity_left() < size {
            return Err(ZbdError::NoSpace);
        }

        // Drain any outstanding asynchronous write first.
        self.sync()?;

        let mut written = 0;
        while written < data.len() {
            let wp = self.wp.load(Ordering::Acquire);
            let n = self.backend.pwrite_at(&data[written..], wp)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "device accepted zero bytes",
                )
                .into());
            }
            self.wp.fetch_add(n as u64, Ordering::AcqRel);
            self.capacity.fetch_sub(n as u64, Ordering::AcqRel);
            written += n;
        }

        Ok(())
    }

    /// Submit a single asynchronous append and return immediately.
    ///
    /// The write pointer and remaining capacity advance optimistically by
    /// the full submission size: the zone is single-writer, so the position
    /// is predictable, and [`sync`](Self::sync) converts a short completion
    /// into an error.
    pub fn append_async(&self, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        debug_assert_eq!(size % u64::from(self.block_size), 0, "unaligned append");

        // Drain any outstanding asynchronous write first.
        self.sync()?;

        if self.capacity_left() < size {
            return Err(ZbdError::NoSpace);
        }

        let wp = self.wp.load(Ordering::Acquire);
        {
            let mut wr = self.wr.lock();
            wr.submit(
                Arc::clone(&self.backend),
                self.zone_nr(),
                data.to_vec(),
                wp,
            )?;
        }
        self.wp.fetch_add(size, Ordering::AcqRel);
        self.capacity.fetch_sub(size, Ordering::AcqRel);

        Ok(())
    }

    /// Wait for the in-flight asynchronous write, if any.
    ///
    /// Blocks for at most [`WRITE_COMPLETION_TIMEOUT`]. On timeout the
    /// submission stays in flight and a later `sync` may still reap it; on
    /// a short or failed completion the slot is cleared and the error
    /// surfaces to the caller.
    pub fn sync(&self) -> Result<()> {
        self.wr.lock().reap()
    }

    /// Bytes submitted but not yet reaped. Zero when idle.
    #[must_use]
    pub fn inflight_bytes(&self) -> u64 {
        self.wr.lock().inflight_bytes()
    }

    // ── Zone management ────────────────────────────────────────────────────

    /// Issue a device close for a partially written zone.
    ///
    /// Clears the write ownership flag after a successful close; on error
    /// the flag is left set so the zone cannot be re-allocated in a state
    /// the device refused to leave.
    pub fn close(&self) -> Result<()> {
        if !(self.is_empty() || self.is_full()) {
            self.backend.close_zone(self.start, self.zone_size)?;
        }
        self.open_for_write.store(false, Ordering::Release);
        Ok(())
    }

    /// Transition a partially written zone to Full.
    pub fn finish(&self) -> Result<()> {
        self.backend.finish_zone(self.start, self.zone_size)?;
        self.capacity.store(0, Ordering::Release);
        self.wp.store(self.start + self.zone_size, Ordering::Release);
        Ok(())
    }

    /// Reset the zone and refresh its state from a fresh device report.
    pub fn reset(&self) -> Result<()> {
        self.backend.reset_zone(self.start, self.zone_size)?;

        let report = self.backend.report_zones(self.start, self.zone_size)?;
        let desc = report.first().ok_or_else(|| {
            ZbdError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "empty zone report after reset",
            ))
        })?;

        if desc.condition == ZoneCondition::Offline {
            self.capacity.store(0, Ordering::Release);
        } else {
            self.max_capacity.store(desc.max_capacity, Ordering::Release);
            self.capacity.store(desc.max_capacity, Ordering::Release);
        }
        self.wp.store(self.start, Ordering::Release);
        self.set_lifetime(LifetimeHint::NotSet);

        Ok(())
    }

    /// Finish writing: drain, close, and release the quota slots.
    ///
    /// The close and the counter decrements run under the zone-resources
    /// lock so a parked allocator observes them together; one waiter is
    /// woken afterwards. The first error is returned, but the bookkeeping
    /// runs regardless so the quota cannot leak.
    pub fn close_write(&self) -> Result<()> {
        debug_assert!(self.open_for_write.load(Ordering::Acquire));
        let sync_res = self.sync();

        let close_res = {
            let _guard = self.resources.lock();
            let res = self.close();
            if res.is_ok() {
                self.resources.notify_io_zone_closed();
            }
            if self.is_full() {
                self.resources.notify_io_zone_full();
            }
            res
        };

        sync_res.and(close_res)
    }
}

// ── Single-slot asynchronous write context ──────────────────────────────────

struct WriteJob {
    data: Vec<u8>,
    offset: u64,
    done_tx: mpsc::SyncSender<Result<usize>>,
}

struct IoWorker {
    submit_tx: mpsc::Sender<WriteJob>,
}

struct Inflight {
    submitted: u64,
    done_rx: mpsc::Receiver<Result<usize>>,
}

/// Depth-1 asynchronous write slot.
///
/// The worker thread is spawned on first submission and exits when the
/// zone drops its submission channel; an outstanding write finishes in the
/// background rather than blocking destruction.
pub(crate) struct WriteContext {
    worker: Option<IoWorker>,
    inflight: Option<Inflight>,
}

impl WriteContext {
    fn new() -> Self {
        Self {
            worker: None,
            inflight: None,
        }
    }

    fn inflight_bytes(&self) -> u64 {
        self.inflight.as_ref().map_or(0, |w| w.submitted)
    }

    fn submit(
        &mut self,
        backend: Arc<dyn ZonedBackend>,
        zone_nr: ZoneNumber,
        data: Vec<u8>,
        offset: u64,
    ) -> Result<()> {
        debug_assert!(self.inflight.is_none(), "write slot already occupied");

        if self.worker.is_none() {
            self.worker = Some(spawn_io_worker(backend, zone_nr)?);
        }
        let worker = self.worker.as_ref().expect("worker just ensured");

        let submitted = data.len() as u64;
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        worker
            .submit_tx
            .send(WriteJob {
                data,
                offset,
                done_tx,
            })
            .map_err(|_| {
                ZbdError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "zone I/O worker exited",
                ))
            })?;

        self.inflight = Some(Inflight { submitted, done_rx });
        Ok(())
    }

    fn reap(&mut self) -> Result<()> {
        let Some(inflight) = self.inflight.take() else {
            return Ok(());
        };

        match inflight.done_rx.recv_timeout(WRITE_COMPLETION_TIMEOUT) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    target: "zbdfs::zone",
                    event = "write_completion_timeout",
                    submitted = inflight.submitted
                );
                // Still in flight; put the slot back so a later sync can
                // reap the completion when it finally lands.
                self.inflight = Some(inflight);
                Err(ZbdError::CompletionTimeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ZbdError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "zone I/O worker exited with a write in flight",
            ))),
            Ok(Err(err)) => Err(err),
            Ok(Ok(completed)) => {
                let completed = completed as u64;
                if completed < inflight.submitted {
                    warn!(
                        target: "zbdfs::zone",
                        event = "short_async_write",
                        submitted = inflight.submitted,
                        completed
                    );
                    return Err(ZbdError::ShortWrite {
                        submitted: inflight.submitted,
                        completed,
                    });
                }
                Ok(())
            }
        }
    }
}

fn spawn_io_worker(backend: Arc<dyn ZonedBackend>, zone_nr: ZoneNumber) -> Result<IoWorker> {
    let (submit_tx, submit_rx) = mpsc::channel::<WriteJob>();
    std::thread::Builder::new()
        .name(format!("zbd-zone{zone_nr}-io"))
        .spawn(move || {
            // One positional write per job; a short transfer is reported
            // as-is and never resubmitted from here.
            while let Ok(job) = submit_rx.recv() {
                let res = backend.pwrite_at(&job.data, job.offset);
                let _ = job.done_tx.send(res);
            }
        })
        .map_err(ZbdError::Io)?;
    Ok(IoWorker { submit_tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use zbd_device::{EmuConfig, EmuZoned, WriteFault};
    use zbd_types::DeviceModel;

    const ZONE: u64 = 256 * 1024;
    const BLOCK: usize = 4096;

    fn test_device() -> Arc<EmuZoned> {
        Arc::new(
            EmuZoned::new(EmuConfig {
                zone_size: ZONE,
                zone_capacity: ZONE,
                nr_zones: 8,
                model: DeviceModel::HostManaged,
                ..EmuConfig::default()
            })
            .unwrap(),
        )
    }

    fn test_zone(dev: &Arc<EmuZoned>, idx: u64) -> Zone {
        let backend: Arc<dyn ZonedBackend> = Arc::clone(dev) as _;
        let desc = backend.report_zones(idx * ZONE, ZONE).unwrap()[0];
        Zone::new(backend, Arc::new(ZoneResources::new()), &desc, BLOCK as u32)
    }

    #[test]
    fn append_advances_write_pointer() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        assert!(zone.is_empty());
        zone.append(&[0x11_u8; BLOCK]).unwrap();
        assert_eq!(zone.wp(), zone.start() + BLOCK as u64);
        assert_eq!(zone.capacity_left(), ZONE - BLOCK as u64);
        assert!(!zone.is_empty());
    }

    #[test]
    fn append_retries_short_device_writes() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        dev.inject_write_fault(WriteFault::Short {
            completed: BLOCK as u64,
        });
        zone.append(&[0x22_u8; 4 * BLOCK]).unwrap();
        assert_eq!(zone.wp(), zone.start() + 4 * BLOCK as u64);

        let mut back = vec![0_u8; 4 * BLOCK];
        dev.read_exact_at(&mut back, zone.start(), false).unwrap();
        assert!(back.iter().all(|&b| b == 0x22));
    }

    #[test]
    fn append_returns_no_space_without_state_change() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        let fill = vec![1_u8; ZONE as usize];
        zone.append(&fill).unwrap();
        assert!(zone.is_full());

        let wp_before = zone.wp();
        let err = zone.append(&[1_u8; BLOCK]).unwrap_err();
        assert!(matches!(err, ZbdError::NoSpace));
        assert_eq!(zone.wp(), wp_before);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "unaligned append")]
    fn unaligned_append_asserts_in_debug() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);
        let _ = zone.append(&[0_u8; 3000]);
    }

    #[test]
    fn async_append_drains_previous_submission() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        zone.append_async(&[0x33_u8; 4 * BLOCK]).unwrap();
        assert_eq!(zone.inflight_bytes(), 4 * BLOCK as u64);
        // The second submission reaps the first internally.
        zone.append_async(&[0x44_u8; 4 * BLOCK]).unwrap();
        zone.sync().unwrap();

        assert_eq!(zone.inflight_bytes(), 0);
        assert_eq!(zone.wp(), zone.start() + 8 * BLOCK as u64);
        assert_eq!(zone.capacity_left(), ZONE - 8 * BLOCK as u64);

        let mut back = vec![0_u8; 8 * BLOCK];
        dev.read_exact_at(&mut back, zone.start(), false).unwrap();
        assert!(back[..4 * BLOCK].iter().all(|&b| b == 0x33));
        assert!(back[4 * BLOCK..].iter().all(|&b| b == 0x44));
    }

    #[test]
    fn sync_is_noop_when_idle() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);
        zone.sync().unwrap();
    }

    #[test]
    fn short_async_completion_surfaces_error_and_leaves_wp() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        dev.inject_write_fault(WriteFault::Short {
            completed: BLOCK as u64,
        });
        zone.append_async(&[5_u8; 4 * BLOCK]).unwrap();
        let advanced = zone.start() + 4 * BLOCK as u64;
        assert_eq!(zone.wp(), advanced);

        let err = zone.sync().unwrap_err();
        assert!(matches!(
            err,
            ZbdError::ShortWrite {
                submitted: 16384,
                completed: 4096
            }
        ));
        // Documented limitation: the optimistic advance is not rolled back.
        assert_eq!(zone.wp(), advanced);
        // The slot is cleared; a later sync does not wait again.
        assert_eq!(zone.inflight_bytes(), 0);
        zone.sync().unwrap();
    }

    #[test]
    fn stalled_completion_times_out() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        dev.inject_write_fault(WriteFault::Delay(Duration::from_millis(1800)));
        zone.append_async(&[6_u8; BLOCK]).unwrap();

        let begin = Instant::now();
        let err = zone.sync().unwrap_err();
        let waited = begin.elapsed();
        assert!(matches!(err, ZbdError::CompletionTimeout));
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1700), "waited {waited:?}");

        // The write is still in flight and can be reaped once it lands.
        assert_eq!(zone.inflight_bytes(), BLOCK as u64);
        zone.sync().unwrap();
        assert_eq!(zone.inflight_bytes(), 0);
    }

    #[test]
    fn failed_async_write_reports_io_error() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        dev.inject_write_fault(WriteFault::Error);
        zone.append_async(&[7_u8; BLOCK]).unwrap();
        let err = zone.sync().unwrap_err();
        assert!(matches!(err, ZbdError::Io(_)));
        assert_eq!(zone.inflight_bytes(), 0);
    }

    #[test]
    fn reset_restores_empty_state() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        zone.set_lifetime(LifetimeHint::Long);
        zone.append(&[9_u8; 2 * BLOCK]).unwrap();

        zone.reset().unwrap();
        assert_eq!(zone.wp(), zone.start());
        assert_eq!(zone.capacity_left(), zone.max_capacity());
        assert_eq!(zone.lifetime(), LifetimeHint::NotSet);
        assert!(zone.is_empty());
    }

    #[test]
    fn finish_fills_partially_written_zone() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        zone.append(&[3_u8; BLOCK]).unwrap();
        zone.finish().unwrap();
        assert!(zone.is_full());
        assert_eq!(zone.wp(), zone.start() + zone.zone_size());
        assert_eq!(zone.capacity_left(), 0);
    }

    #[test]
    fn append_then_sync_totals_match() {
        let dev = test_device();
        let zone = test_zone(&dev, 0);

        let mut expected = 0_u64;
        for i in 0..6 {
            let buf = vec![i as u8; BLOCK * (1 + i % 3)];
            if i % 2 == 0 {
                zone.append(&buf).unwrap();
            } else {
                zone.append_async(&buf).unwrap();
            }
            expected += buf.len() as u64;
        }
        zone.sync().unwrap();
        assert_eq!(zone.wp() - zone.start(), expected);
        assert_eq!(zone.capacity_left(), ZONE - expected);
    }

    #[test]
    fn snapshot_reflects_state() {
        let dev = test_device();
        let zone = test_zone(&dev, 1);
        zone.set_lifetime(LifetimeHint::Medium);
        zone.append(&[1_u8; BLOCK]).unwrap();
        zone.add_used_capacity(BLOCK as i64);

        let snap = zone.snapshot();
        assert_eq!(snap.start, ZONE);
        assert_eq!(snap.wp, ZONE + BLOCK as u64);
        assert_eq!(snap.lifetime, LifetimeHint::Medium.as_u8());
        assert_eq!(snap.used_capacity, BLOCK as i64);

        let json = serde_json::to_value(&snap).unwrap();
        for key in [
            "start",
            "capacity",
            "max_capacity",
            "wp",
            "lifetime",
            "used_capacity",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
