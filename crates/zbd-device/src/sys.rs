//! Kernel blkzoned ABI: ioctl numbers and on-wire structs.
//!
//! The platform crates do not export the blkzoned interface, so the
//! definitions from `<linux/blkzoned.h>` live here. This is the only module
//! in the workspace that uses `unsafe`; every wrapper validates lengths and
//! owns its buffers, so callers stay in safe Rust.

// The ABI table is kept complete even where the engine has no caller yet.
#![allow(dead_code)]

use std::os::fd::RawFd;

use zbd_error::{Result, ZbdError};

// Zone types (`blk_zone.type`).
pub const BLK_ZONE_TYPE_CONVENTIONAL: u8 = 0x1;
pub const BLK_ZONE_TYPE_SEQWRITE_REQ: u8 = 0x2;
pub const BLK_ZONE_TYPE_SEQWRITE_PREF: u8 = 0x3;

// Zone conditions (`blk_zone.cond`).
pub const BLK_ZONE_COND_NOT_WP: u8 = 0x0;
pub const BLK_ZONE_COND_EMPTY: u8 = 0x1;
pub const BLK_ZONE_COND_IMP_OPEN: u8 = 0x2;
pub const BLK_ZONE_COND_EXP_OPEN: u8 = 0x3;
pub const BLK_ZONE_COND_CLOSED: u8 = 0x4;
pub const BLK_ZONE_COND_READONLY: u8 = 0xD;
pub const BLK_ZONE_COND_FULL: u8 = 0xE;
pub const BLK_ZONE_COND_OFFLINE: u8 = 0xF;

/// Report flag: the `capacity` field is populated.
pub const BLK_ZONE_REP_CAPACITY: u32 = 1 << 0;

/// One zone as reported by BLKREPORTZONE. Sector units (512 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlkZone {
    pub start: u64,
    pub len: u64,
    pub wp: u64,
    pub zone_type: u8,
    pub cond: u8,
    pub non_seq: u8,
    pub reset: u8,
    pub resv: [u8; 4],
    pub capacity: u64,
    pub reserved: [u8; 24],
}

/// Header for BLKREPORTZONE. Immediately followed by `nr_zones` [`BlkZone`]s.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlkZoneReport {
    pub sector: u64,
    pub nr_zones: u32,
    pub flags: u32,
}

/// Sector range argument for the zone management ioctls.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlkZoneRange {
    pub sector: u64,
    pub nr_sectors: u64,
}

// _IOx encoding used by the block layer on every architecture we target.
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | (0x12 << 8) | nr
}

pub const BLKREPORTZONE: libc::c_ulong =
    ioc(IOC_READ | IOC_WRITE, 130, std::mem::size_of::<BlkZoneReport>());
pub const BLKRESETZONE: libc::c_ulong =
    ioc(IOC_WRITE, 131, std::mem::size_of::<BlkZoneRange>());
pub const BLKGETZONESZ: libc::c_ulong = ioc(IOC_READ, 132, std::mem::size_of::<u32>());
pub const BLKGETNRZONES: libc::c_ulong = ioc(IOC_READ, 133, std::mem::size_of::<u32>());
pub const BLKOPENZONE: libc::c_ulong = ioc(IOC_WRITE, 134, std::mem::size_of::<BlkZoneRange>());
pub const BLKCLOSEZONE: libc::c_ulong =
    ioc(IOC_WRITE, 135, std::mem::size_of::<BlkZoneRange>());
pub const BLKFINISHZONE: libc::c_ulong =
    ioc(IOC_WRITE, 136, std::mem::size_of::<BlkZoneRange>());

/// Zones per BLKREPORTZONE batch; the kernel caps what it fills anyway.
pub const REPORT_BATCH: usize = 128;

/// Fixed-size report buffer: header plus a zone batch.
#[repr(C)]
pub struct ZoneReportBuf {
    pub header: BlkZoneReport,
    pub zones: [BlkZone; REPORT_BATCH],
}

impl ZoneReportBuf {
    pub fn new(sector: u64) -> Box<Self> {
        let zone = BlkZone {
            start: 0,
            len: 0,
            wp: 0,
            zone_type: 0,
            cond: 0,
            non_seq: 0,
            reset: 0,
            resv: [0; 4],
            capacity: 0,
            reserved: [0; 24],
        };
        Box::new(Self {
            header: BlkZoneReport {
                sector,
                nr_zones: REPORT_BATCH as u32,
                flags: 0,
            },
            zones: [zone; REPORT_BATCH],
        })
    }
}

fn last_errno(op: &'static str) -> ZbdError {
    let err = std::io::Error::last_os_error();
    tracing::warn!(target: "zbdfs::device", event = "ioctl_failed", op, error = %err);
    ZbdError::Io(err)
}

/// Fill `buf` with the next batch of zones starting at `buf.header.sector`.
pub fn report_zones(fd: RawFd, buf: &mut ZoneReportBuf) -> Result<()> {
    buf.header.nr_zones = REPORT_BATCH as u32;
    // SAFETY: `buf` is a live, exclusively borrowed repr(C) buffer whose
    // header declares exactly the trailing capacity the kernel may fill.
    let rc = unsafe { libc::ioctl(fd, BLKREPORTZONE, &mut buf.header as *mut BlkZoneReport) };
    if rc < 0 {
        return Err(last_errno("report_zones"));
    }
    Ok(())
}

fn zone_range_ioctl(
    fd: RawFd,
    cmd: libc::c_ulong,
    op: &'static str,
    sector: u64,
    nr_sectors: u64,
) -> Result<()> {
    let range = BlkZoneRange { sector, nr_sectors };
    // SAFETY: `range` is a live repr(C) value matching the command's
    // declared argument type; the kernel only reads it.
    let rc = unsafe { libc::ioctl(fd, cmd, &range as *const BlkZoneRange) };
    if rc < 0 {
        return Err(last_errno(op));
    }
    Ok(())
}

pub fn reset_zones(fd: RawFd, sector: u64, nr_sectors: u64) -> Result<()> {
    zone_range_ioctl(fd, BLKRESETZONE, "reset_zones", sector, nr_sectors)
}

pub fn finish_zones(fd: RawFd, sector: u64, nr_sectors: u64) -> Result<()> {
    zone_range_ioctl(fd, BLKFINISHZONE, "finish_zones", sector, nr_sectors)
}

pub fn close_zones(fd: RawFd, sector: u64, nr_sectors: u64) -> Result<()> {
    zone_range_ioctl(fd, BLKCLOSEZONE, "close_zones", sector, nr_sectors)
}

pub fn nr_zones(fd: RawFd) -> Result<u32> {
    let mut out: u32 = 0;
    // SAFETY: BLKGETNRZONES writes a single u32 through the pointer.
    let rc = unsafe { libc::ioctl(fd, BLKGETNRZONES, &mut out as *mut u32) };
    if rc < 0 {
        return Err(last_errno("nr_zones"));
    }
    Ok(out)
}

/// Zone size in 512-byte sectors.
pub fn zone_sectors(fd: RawFd) -> Result<u32> {
    let mut out: u32 = 0;
    // SAFETY: BLKGETZONESZ writes a single u32 through the pointer.
    let rc = unsafe { libc::ioctl(fd, BLKGETZONESZ, &mut out as *mut u32) };
    if rc < 0 {
        return Err(last_errno("zone_sectors"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        assert_eq!(BLKREPORTZONE, 0xC010_1282);
        assert_eq!(BLKRESETZONE, 0x4010_1283);
        assert_eq!(BLKGETZONESZ, 0x8004_1284);
        assert_eq!(BLKGETNRZONES, 0x8004_1285);
        assert_eq!(BLKOPENZONE, 0x4010_1286);
        assert_eq!(BLKCLOSEZONE, 0x4010_1287);
        assert_eq!(BLKFINISHZONE, 0x4010_1288);
    }

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(std::mem::size_of::<BlkZone>(), 64);
        assert_eq!(std::mem::size_of::<BlkZoneReport>(), 16);
        assert_eq!(std::mem::size_of::<BlkZoneRange>(), 16);
    }
}
