//! Device seam for host-managed zoned block devices.
//!
//! Provides the [`ZonedBackend`] trait that abstracts the zone-management
//! and positional-I/O surface of a zoned device, plus two implementations:
//!
//! - **[`LinuxZoned`]**: a real `/dev/<name>` block device driven through
//!   the kernel blkzoned ioctls, with the scheduler probe and the
//!   three-descriptor open protocol (buffered read, direct read,
//!   direct + exclusive write).
//! - **[`EmuZoned`]**: an in-memory host-managed device with
//!   sequential-write enforcement and fault injection, for tests and
//!   development machines without zoned hardware.
//!
//! Raw ioctl access is confined to the `sys` module; everything else in the
//! workspace forbids `unsafe`.

use zbd_error::Result;
use zbd_types::{DeviceGeometry, ZoneDescriptor};

mod emu;
mod linux;
mod sys;

pub use emu::{EmuConfig, EmuZoned, WriteFault};
pub use linux::LinuxZoned;

/// Whether a device is opened with a write descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

impl OpenMode {
    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Zone-management and positional-I/O surface of a zoned block device.
///
/// Offsets and lengths are bytes. Positional reads and writes may be short;
/// callers own the retry policy, because the append path and the
/// asynchronous write path treat short transfers differently.
pub trait ZonedBackend: Send + Sync {
    /// Static geometry and quotas, fixed for the life of the handle.
    fn geometry(&self) -> DeviceGeometry;

    /// Device node path, for diagnostics.
    fn path(&self) -> &str;

    /// Verify the kernel-side configuration required for correct operation.
    ///
    /// The real backend checks that the request scheduler is `mq-deadline`,
    /// which the block layer requires to preserve write ordering on zoned
    /// devices. Backends without a kernel queue accept unconditionally.
    fn check_scheduler(&self) -> Result<()> {
        Ok(())
    }

    /// Report all zones intersecting `[start, start + len)`.
    fn report_zones(&self, start: u64, len: u64) -> Result<Vec<ZoneDescriptor>>;

    /// Reset the zones in `[start, start + len)`, rewinding write pointers.
    fn reset_zone(&self, start: u64, len: u64) -> Result<()>;

    /// Transition the zones in `[start, start + len)` to Full.
    fn finish_zone(&self, start: u64, len: u64) -> Result<()>;

    /// Close the zones in `[start, start + len)`.
    fn close_zone(&self, start: u64, len: u64) -> Result<()>;

    /// Positional read; returns the number of bytes read (may be short).
    ///
    /// `direct` selects the O_DIRECT read descriptor where one exists.
    fn pread_at(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize>;

    /// Positional write; returns the number of bytes written (may be short).
    fn pwrite_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`, retrying short reads.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.pread_at(&mut buf[done..], offset + done as u64, direct)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of device",
                )
                .into());
            }
            done += n;
        }
        Ok(())
    }
}
