//! Real zoned block device backend.
//!
//! Opens `/dev/<name>` three times (buffered read, direct read, direct +
//! exclusive write), reads geometry from the blkzoned ioctls and sysfs, and
//! maps the kernel zone report into [`ZoneDescriptor`]s.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use tracing::info;
use zbd_error::{Result, ZbdError};
use zbd_types::{
    BlockSize, DeviceGeometry, DeviceModel, ZoneCondition, ZoneDescriptor, ZoneType, SECTOR_SIZE,
};

use crate::sys;
use crate::{OpenMode, ZonedBackend};

/// A host-managed zoned block device node.
pub struct LinuxZoned {
    devname: String,
    path: String,
    read_f: File,
    read_direct_f: File,
    write_f: Option<File>,
    geometry: DeviceGeometry,
}

impl std::fmt::Debug for LinuxZoned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxZoned")
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("readonly", &self.write_f.is_none())
            .finish_non_exhaustive()
    }
}

impl LinuxZoned {
    /// Open the device node `/dev/<devname>`.
    ///
    /// `ReadWrite` mode takes the write descriptor with O_DIRECT | O_EXCL,
    /// so a second writer on the same node is refused by the kernel.
    pub fn open(devname: &str, mode: OpenMode) -> Result<Self> {
        let path = format!("/dev/{devname}");

        let open_err = |err: std::io::Error| {
            ZbdError::InvalidArgument(format!("failed to open zoned block device {path}: {err}"))
        };

        let read_f = OpenOptions::new().read(true).open(&path).map_err(open_err)?;
        let read_direct_f = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(&path)
            .map_err(open_err)?;
        let write_f = if mode.is_read_only() {
            None
        } else {
            Some(
                OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_DIRECT | libc::O_EXCL)
                    .open(&path)
                    .map_err(open_err)?,
            )
        };

        let fd = read_f.as_raw_fd();
        let zone_size = u64::from(sys::zone_sectors(fd)?) * SECTOR_SIZE;
        if zone_size == 0 {
            return Err(ZbdError::NotSupported(format!(
                "{path} reports zero zone size"
            )));
        }
        let nr_zones = u64::from(sys::nr_zones(fd)?);

        let block_size = BlockSize::new(queue_attr_u32(devname, "physical_block_size")?)
            .map_err(|err| ZbdError::InvalidArgument(err.to_string()))?;
        let model = match queue_attr(devname, "zoned")?.as_str() {
            "host-managed" => DeviceModel::HostManaged,
            "host-aware" => DeviceModel::HostAware,
            _ => DeviceModel::NotZoned,
        };

        // sysfs reports 0 when the device imposes no limit.
        let cap_or_nr = |limit: u32| -> u32 {
            if limit == 0 {
                u32::try_from(nr_zones).unwrap_or(u32::MAX)
            } else {
                limit
            }
        };
        let max_active_zones = cap_or_nr(queue_attr_u32(devname, "max_active_zones")?);
        let max_open_zones = cap_or_nr(queue_attr_u32(devname, "max_open_zones")?);

        let geometry = DeviceGeometry {
            block_size,
            zone_size,
            nr_zones,
            max_active_zones,
            max_open_zones,
            model,
        };

        info!(
            target: "zbdfs::device",
            event = "device_opened",
            path = %path,
            nr_zones,
            zone_size,
            max_active_zones,
            max_open_zones,
            readonly = mode.is_read_only()
        );

        Ok(Self {
            devname: devname.to_owned(),
            path,
            read_f,
            read_direct_f,
            write_f,
            geometry,
        })
    }

    fn write_fd(&self) -> Result<&File> {
        self.write_f.as_ref().ok_or_else(|| {
            ZbdError::InvalidArgument(format!("{} is opened read-only", self.path))
        })
    }
}

impl ZonedBackend for LinuxZoned {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn check_scheduler(&self) -> Result<()> {
        let line = queue_attr(&self.devname, "scheduler")?;
        if !scheduler_is_mq_deadline(&line) {
            return Err(ZbdError::InvalidArgument(format!(
                "I/O scheduler for {} is not mq-deadline (got {line:?}); set it to mq-deadline",
                self.path
            )));
        }
        Ok(())
    }

    fn report_zones(&self, start: u64, len: u64) -> Result<Vec<ZoneDescriptor>> {
        let end_sector = (start + len) / SECTOR_SIZE;
        let mut sector = start / SECTOR_SIZE;
        let mut out = Vec::new();

        while sector < end_sector {
            let mut buf = sys::ZoneReportBuf::new(sector);
            sys::report_zones(self.read_f.as_raw_fd(), &mut buf)?;
            let filled = (buf.header.nr_zones as usize).min(sys::REPORT_BATCH);
            if filled == 0 {
                break;
            }
            let has_capacity = buf.header.flags & sys::BLK_ZONE_REP_CAPACITY != 0;
            for z in &buf.zones[..filled] {
                if z.start >= end_sector {
                    return Ok(out);
                }
                out.push(descriptor_from_raw(z, has_capacity));
                sector = z.start + z.len;
            }
        }

        Ok(out)
    }

    fn reset_zone(&self, start: u64, len: u64) -> Result<()> {
        sys::reset_zones(
            self.write_fd()?.as_raw_fd(),
            start / SECTOR_SIZE,
            len / SECTOR_SIZE,
        )
    }

    fn finish_zone(&self, start: u64, len: u64) -> Result<()> {
        sys::finish_zones(
            self.write_fd()?.as_raw_fd(),
            start / SECTOR_SIZE,
            len / SECTOR_SIZE,
        )
    }

    fn close_zone(&self, start: u64, len: u64) -> Result<()> {
        sys::close_zones(
            self.write_fd()?.as_raw_fd(),
            start / SECTOR_SIZE,
            len / SECTOR_SIZE,
        )
    }

    fn pread_at(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize> {
        let f = if direct { &self.read_direct_f } else { &self.read_f };
        Ok(f.read_at(buf, offset)?)
    }

    fn pwrite_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.write_fd()?.write_at(buf, offset)?)
    }
}

fn descriptor_from_raw(z: &sys::BlkZone, has_capacity: bool) -> ZoneDescriptor {
    let capacity_sectors = if has_capacity { z.capacity } else { z.len };
    ZoneDescriptor {
        start: z.start * SECTOR_SIZE,
        zone_size: z.len * SECTOR_SIZE,
        max_capacity: capacity_sectors * SECTOR_SIZE,
        wp: z.wp * SECTOR_SIZE,
        zone_type: match z.zone_type {
            sys::BLK_ZONE_TYPE_SEQWRITE_REQ => ZoneType::SequentialWriteRequired,
            _ => ZoneType::Conventional,
        },
        condition: condition_from_raw(z.cond),
    }
}

fn condition_from_raw(cond: u8) -> ZoneCondition {
    match cond {
        // Conventional zones have no write pointer; report them writable.
        sys::BLK_ZONE_COND_NOT_WP | sys::BLK_ZONE_COND_EMPTY => ZoneCondition::Empty,
        sys::BLK_ZONE_COND_IMP_OPEN => ZoneCondition::ImplicitOpen,
        sys::BLK_ZONE_COND_EXP_OPEN => ZoneCondition::ExplicitOpen,
        sys::BLK_ZONE_COND_CLOSED => ZoneCondition::Closed,
        sys::BLK_ZONE_COND_READONLY => ZoneCondition::ReadOnly,
        sys::BLK_ZONE_COND_FULL => ZoneCondition::Full,
        _ => ZoneCondition::Offline,
    }
}

/// First line of a sysfs attribute file, trimmed.
fn read_sysfs_attr(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        ZbdError::InvalidArgument(format!("failed to read {}: {err}", path.display()))
    })?;
    Ok(contents.lines().next().unwrap_or("").trim().to_owned())
}

fn queue_attr(devname: &str, attr: &str) -> Result<String> {
    read_sysfs_attr(Path::new(&format!("/sys/block/{devname}/queue/{attr}")))
}

fn queue_attr_u32(devname: &str, attr: &str) -> Result<u32> {
    let raw = queue_attr(devname, attr)?;
    raw.parse().map_err(|_| {
        ZbdError::InvalidArgument(format!(
            "unexpected value {raw:?} in /sys/block/{devname}/queue/{attr}"
        ))
    })
}

/// The active scheduler is bracketed in the sysfs scheduler line.
pub(crate) fn scheduler_is_mq_deadline(line: &str) -> bool {
    line.contains("[mq-deadline]")
}
