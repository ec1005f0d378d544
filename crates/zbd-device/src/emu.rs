//! In-memory emulated host-managed zoned device.
//!
//! Enforces the same rules a real ZBD enforces: writes land exactly at the
//! zone write pointer, never cross the zone capacity, and move the zone
//! through Empty → ImplicitOpen → Full. Zone data is stored sparsely (only
//! written bytes), so large geometries are cheap to emulate.
//!
//! Fault injection covers the failure modes the write path must survive:
//! a short transfer, a delayed completion, and a hard error.

use std::time::Duration;

use parking_lot::Mutex;
use zbd_error::{Result, ZbdError};
use zbd_types::{
    BlockSize, DeviceGeometry, DeviceModel, ZoneCondition, ZoneDescriptor, ZoneType,
};

use crate::ZonedBackend;

/// Geometry of an emulated device.
#[derive(Debug, Clone)]
pub struct EmuConfig {
    pub block_size: u32,
    pub zone_size: u64,
    /// Usable bytes per zone; at most `zone_size`.
    pub zone_capacity: u64,
    pub nr_zones: u64,
    pub max_active_zones: u32,
    pub max_open_zones: u32,
    pub model: DeviceModel,
    /// Zone indices reported as conventional instead of sequential.
    pub conventional_zones: Vec<u64>,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            zone_size: 2 << 20,
            zone_capacity: 2 << 20,
            nr_zones: 64,
            max_active_zones: 14,
            max_open_zones: 14,
            model: DeviceModel::HostManaged,
            conventional_zones: Vec::new(),
        }
    }
}

/// Fault applied to the next positional write.
#[derive(Debug, Clone)]
pub enum WriteFault {
    /// Acknowledge only `completed` bytes.
    Short { completed: u64 },
    /// Sleep before performing the write.
    Delay(Duration),
    /// Fail the write outright.
    Error,
}

#[derive(Debug)]
struct EmuZone {
    cond: ZoneCondition,
    /// Absolute write pointer in bytes.
    wp: u64,
    /// Bytes written since the last reset, from the zone start.
    data: Vec<u8>,
}

/// Emulated zoned device backend.
#[derive(Debug)]
pub struct EmuZoned {
    cfg: EmuConfig,
    geometry: DeviceGeometry,
    path: String,
    zones: Vec<Mutex<EmuZone>>,
    next_write_fault: Mutex<Option<WriteFault>>,
}

impl EmuZoned {
    pub fn new(cfg: EmuConfig) -> Result<Self> {
        let block_size = BlockSize::new(cfg.block_size)
            .map_err(|err| ZbdError::InvalidArgument(err.to_string()))?;
        if cfg.zone_size == 0 || !block_size.is_aligned(cfg.zone_size) {
            return Err(ZbdError::InvalidArgument(
                "zone_size must be a non-zero multiple of block_size".to_owned(),
            ));
        }
        if cfg.zone_capacity > cfg.zone_size || !block_size.is_aligned(cfg.zone_capacity) {
            return Err(ZbdError::InvalidArgument(
                "zone_capacity must be a block-aligned value <= zone_size".to_owned(),
            ));
        }

        let geometry = DeviceGeometry {
            block_size,
            zone_size: cfg.zone_size,
            nr_zones: cfg.nr_zones,
            max_active_zones: cfg.max_active_zones,
            max_open_zones: cfg.max_open_zones,
            model: cfg.model,
        };
        let zones = (0..cfg.nr_zones)
            .map(|idx| {
                Mutex::new(EmuZone {
                    cond: ZoneCondition::Empty,
                    wp: idx * cfg.zone_size,
                    data: Vec::new(),
                })
            })
            .collect();

        Ok(Self {
            path: format!("emu://zbd-{}z", cfg.nr_zones),
            geometry,
            cfg,
            zones,
            next_write_fault: Mutex::new(None),
        })
    }

    /// Default geometry; convenient for tests.
    pub fn with_defaults() -> Self {
        Self::new(EmuConfig::default()).expect("default emu config is valid")
    }

    /// Arm a fault for the next `pwrite_at` call.
    pub fn inject_write_fault(&self, fault: WriteFault) {
        *self.next_write_fault.lock() = Some(fault);
    }

    /// Force a zone condition. Test scaffolding for inventory scenarios.
    pub fn set_condition(&self, zone: u64, cond: ZoneCondition) {
        let mut z = self.zones[zone as usize].lock();
        let start = zone * self.cfg.zone_size;
        match cond {
            ZoneCondition::Empty => {
                z.wp = start;
                z.data.clear();
            }
            ZoneCondition::Full => z.wp = start + self.cfg.zone_size,
            _ => {}
        }
        z.cond = cond;
    }

    fn zone_index(&self, offset: u64) -> Result<usize> {
        let idx = offset / self.cfg.zone_size;
        if idx >= self.cfg.nr_zones {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("offset {offset:#x} beyond device end"),
            )
            .into());
        }
        Ok(idx as usize)
    }

    fn zone_type_of(&self, idx: u64) -> ZoneType {
        if self.cfg.conventional_zones.contains(&idx) {
            ZoneType::Conventional
        } else {
            ZoneType::SequentialWriteRequired
        }
    }

    fn for_each_zone_in(
        &self,
        start: u64,
        len: u64,
        op: &'static str,
        mut f: impl FnMut(&mut EmuZone, u64) -> Result<()>,
    ) -> Result<()> {
        debug_assert!(len > 0);
        let first = self.zone_index(start)?;
        let last = self.zone_index(start + len - 1)?;
        for idx in first..=last {
            let zone_start = idx as u64 * self.cfg.zone_size;
            let mut z = self.zones[idx].lock();
            if matches!(z.cond, ZoneCondition::Offline | ZoneCondition::ReadOnly) {
                return Err(ZbdError::ZoneManagement {
                    op,
                    start: zone_start,
                });
            }
            f(&mut z, zone_start)?;
        }
        Ok(())
    }
}

impl ZonedBackend for EmuZoned {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn report_zones(&self, start: u64, len: u64) -> Result<Vec<ZoneDescriptor>> {
        let mut out = Vec::new();
        for idx in 0..self.cfg.nr_zones {
            let zone_start = idx * self.cfg.zone_size;
            if zone_start + self.cfg.zone_size <= start || zone_start >= start + len {
                continue;
            }
            let z = self.zones[idx as usize].lock();
            out.push(ZoneDescriptor {
                start: zone_start,
                zone_size: self.cfg.zone_size,
                max_capacity: self.cfg.zone_capacity,
                wp: z.wp,
                zone_type: self.zone_type_of(idx),
                condition: z.cond,
            });
        }
        Ok(out)
    }

    fn reset_zone(&self, start: u64, len: u64) -> Result<()> {
        self.for_each_zone_in(start, len, "reset", |z, zone_start| {
            z.cond = ZoneCondition::Empty;
            z.wp = zone_start;
            z.data.clear();
            Ok(())
        })
    }

    fn finish_zone(&self, start: u64, len: u64) -> Result<()> {
        let zone_size = self.cfg.zone_size;
        self.for_each_zone_in(start, len, "finish", |z, zone_start| {
            z.cond = ZoneCondition::Full;
            z.wp = zone_start + zone_size;
            Ok(())
        })
    }

    fn close_zone(&self, start: u64, len: u64) -> Result<()> {
        self.for_each_zone_in(start, len, "close", |z, _| {
            if z.cond.is_open() {
                z.cond = ZoneCondition::Closed;
            }
            Ok(())
        })
    }

    fn pread_at(&self, buf: &mut [u8], offset: u64, _direct: bool) -> Result<usize> {
        if offset >= self.geometry.total_bytes() {
            return Ok(0);
        }
        let idx = self.zone_index(offset)?;
        let zone_start = idx as u64 * self.cfg.zone_size;
        let rel = (offset - zone_start) as usize;
        // Reads never cross a zone boundary; callers loop on short reads.
        let n = buf
            .len()
            .min((self.cfg.zone_size as usize).saturating_sub(rel));

        let z = self.zones[idx].lock();
        for (i, slot) in buf[..n].iter_mut().enumerate() {
            *slot = z.data.get(rel + i).copied().unwrap_or(0);
        }
        Ok(n)
    }

    fn pwrite_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let fault = self.next_write_fault.lock().take();
        let mut len = buf.len() as u64;
        match fault {
            Some(WriteFault::Delay(d)) => std::thread::sleep(d),
            Some(WriteFault::Error) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write error",
                )
                .into());
            }
            Some(WriteFault::Short { completed }) => len = len.min(completed),
            None => {}
        }

        let io_err = |msg: String| -> ZbdError {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, msg).into()
        };

        let block = u64::from(self.cfg.block_size);
        if offset % block != 0 {
            return Err(io_err(format!("unaligned write offset {offset:#x}")));
        }

        let idx = self.zone_index(offset)?;
        let zone_start = idx as u64 * self.cfg.zone_size;
        let sequential = self.zone_type_of(idx as u64) == ZoneType::SequentialWriteRequired;
        let mut z = self.zones[idx].lock();

        if sequential {
            if !z.cond.is_writable() {
                return Err(io_err(format!(
                    "write to unwritable zone {idx} ({:?})",
                    z.cond
                )));
            }
            if offset != z.wp {
                return Err(io_err(format!(
                    "non-sequential write: offset {offset:#x}, write pointer {:#x}",
                    z.wp
                )));
            }
        }
        let cap_end = zone_start + self.cfg.zone_capacity;
        if offset + len > cap_end {
            return Err(io_err(format!(
                "write crosses zone capacity: end {:#x}, capacity end {cap_end:#x}",
                offset + len
            )));
        }

        let rel = (offset - zone_start) as usize;
        let end = rel + len as usize;
        if z.data.len() < end {
            z.data.resize(end, 0);
        }
        z.data[rel..end].copy_from_slice(&buf[..len as usize]);
        if sequential {
            z.wp = offset + len;
            z.cond = if z.wp == cap_end {
                ZoneCondition::Full
            } else {
                ZoneCondition::ImplicitOpen
            };
        }

        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZonedBackend;

    fn small() -> EmuZoned {
        EmuZoned::new(EmuConfig {
            zone_size: 64 * 1024,
            zone_capacity: 64 * 1024,
            nr_zones: 4,
            ..EmuConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(EmuZoned::new(EmuConfig {
            zone_capacity: 3 << 20,
            ..EmuConfig::default()
        })
        .is_err());
        assert!(EmuZoned::new(EmuConfig {
            block_size: 3000,
            ..EmuConfig::default()
        })
        .is_err());
    }

    #[test]
    fn write_read_roundtrip() {
        let dev = small();
        let data = vec![0xA5_u8; 8192];
        assert_eq!(dev.pwrite_at(&data, 0).unwrap(), 8192);

        let mut back = vec![0_u8; 8192];
        dev.read_exact_at(&mut back, 0, false).unwrap();
        assert_eq!(back, data);

        // Unwritten space reads as zeros.
        let mut tail = vec![0xFF_u8; 4096];
        dev.read_exact_at(&mut tail, 8192, false).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn enforces_sequential_writes() {
        let dev = small();
        dev.pwrite_at(&[0_u8; 4096], 0).unwrap();
        // Not at the write pointer.
        assert!(dev.pwrite_at(&[0_u8; 4096], 0).is_err());
        assert!(dev.pwrite_at(&[0_u8; 4096], 12288).is_err());
        // At the write pointer.
        dev.pwrite_at(&[0_u8; 4096], 4096).unwrap();
    }

    #[test]
    fn write_cannot_cross_capacity() {
        let dev = small();
        let zone_cap = 64 * 1024;
        dev.pwrite_at(&vec![1_u8; zone_cap - 4096], 0).unwrap();
        assert!(dev.pwrite_at(&[1_u8; 8192], (zone_cap - 4096) as u64).is_err());
        dev.pwrite_at(&[1_u8; 4096], (zone_cap - 4096) as u64).unwrap();

        let report = dev.report_zones(0, 64 * 1024).unwrap();
        assert_eq!(report[0].condition, ZoneCondition::Full);
        assert_eq!(report[0].capacity_remaining(), 0);
    }

    #[test]
    fn reset_and_finish_transitions() {
        let dev = small();
        dev.pwrite_at(&[7_u8; 4096], 0).unwrap();

        dev.finish_zone(0, 64 * 1024).unwrap();
        let report = dev.report_zones(0, 64 * 1024).unwrap();
        assert_eq!(report[0].condition, ZoneCondition::Full);

        dev.reset_zone(0, 64 * 1024).unwrap();
        let report = dev.report_zones(0, 64 * 1024).unwrap();
        assert_eq!(report[0].condition, ZoneCondition::Empty);
        assert_eq!(report[0].wp, report[0].start);
    }

    #[test]
    fn close_moves_open_zone_to_closed() {
        let dev = small();
        dev.pwrite_at(&[1_u8; 4096], 0).unwrap();
        dev.close_zone(0, 64 * 1024).unwrap();
        let report = dev.report_zones(0, 64 * 1024).unwrap();
        assert_eq!(report[0].condition, ZoneCondition::Closed);
    }

    #[test]
    fn management_fails_on_offline_zone() {
        let dev = small();
        dev.set_condition(1, ZoneCondition::Offline);
        let start = 64 * 1024;
        assert!(dev.reset_zone(start, 64 * 1024).is_err());
        assert!(dev.finish_zone(start, 64 * 1024).is_err());
    }

    #[test]
    fn short_write_fault() {
        let dev = small();
        dev.inject_write_fault(WriteFault::Short { completed: 4096 });
        assert_eq!(dev.pwrite_at(&[2_u8; 16384], 0).unwrap(), 4096);
        // Fault is one-shot.
        assert_eq!(dev.pwrite_at(&[2_u8; 4096], 4096).unwrap(), 4096);
    }

    #[test]
    fn error_write_fault() {
        let dev = small();
        dev.inject_write_fault(WriteFault::Error);
        assert!(dev.pwrite_at(&[0_u8; 4096], 0).is_err());
    }

    #[test]
    fn report_covers_requested_range_only() {
        let dev = small();
        let report = dev.report_zones(64 * 1024, 2 * 64 * 1024).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].start, 64 * 1024);
        assert_eq!(report[1].start, 2 * 64 * 1024);
    }

    #[test]
    fn conventional_zone_reported_and_random_writable() {
        let dev = EmuZoned::new(EmuConfig {
            zone_size: 64 * 1024,
            zone_capacity: 64 * 1024,
            nr_zones: 4,
            conventional_zones: vec![0],
            ..EmuConfig::default()
        })
        .unwrap();
        let report = dev.report_zones(0, 4 * 64 * 1024).unwrap();
        assert_eq!(report[0].zone_type, ZoneType::Conventional);
        assert_eq!(report[1].zone_type, ZoneType::SequentialWriteRequired);
        // Conventional zones accept out-of-order writes.
        dev.pwrite_at(&[1_u8; 4096], 8192).unwrap();
        dev.pwrite_at(&[1_u8; 4096], 0).unwrap();
    }
}
