#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sector size the kernel block layer uses for zoned-device accounting.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated physical block size (power of two in 512..=65536).
///
/// All append sizes and write-pointer positions are multiples of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether `len` is a whole number of blocks.
    #[must_use]
    pub fn is_aligned(self, len: u64) -> bool {
        len % u64::from(self.0) == 0
    }
}

/// Zone index on the device (byte start / zone size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneNumber(pub u64);

impl std::fmt::Display for ZoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Expected write lifetime class for data placed in a zone.
///
/// Declaration order is significant: variants compare by expected lifetime,
/// so `Long > Short` holds and the allocator can compute hint distances.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LifetimeHint {
    #[default]
    NotSet = 0,
    None = 1,
    Short = 2,
    Medium = 3,
    Long = 4,
    Extreme = 5,
}

impl LifetimeHint {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a stored hint value. Unknown values map to `NotSet`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::None,
            2 => Self::Short,
            3 => Self::Medium,
            4 => Self::Long,
            5 => Self::Extreme,
            _ => Self::NotSet,
        }
    }
}

/// Zone type from the device zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneType {
    /// Random-write capable; not used for data placement.
    Conventional,
    /// Must be written sequentially at the write pointer.
    SequentialWriteRequired,
}

/// Zone condition from the device zone report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneCondition {
    Empty,
    ImplicitOpen,
    ExplicitOpen,
    Closed,
    Full,
    ReadOnly,
    Offline,
}

impl ZoneCondition {
    /// Whether this condition counts against the device's active-zone quota.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::ImplicitOpen | Self::ExplicitOpen | Self::Closed)
    }

    /// Whether the device holds the zone open (implicitly or explicitly).
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::ImplicitOpen | Self::ExplicitOpen)
    }

    /// Whether appends can ever succeed in this condition.
    #[must_use]
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Full | Self::ReadOnly | Self::Offline)
    }
}

/// One row of a device zone report.
///
/// `max_capacity` is the usable byte count and may be smaller than
/// `zone_size` (the guard gap between them is never writable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    /// Byte offset of the zone start.
    pub start: u64,
    /// Logical zone size in bytes, including any unusable guard area.
    pub zone_size: u64,
    /// Usable capacity in bytes.
    pub max_capacity: u64,
    /// Current write pointer (byte offset; `start..=start + zone_size`).
    pub wp: u64,
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
}

impl ZoneDescriptor {
    #[must_use]
    pub fn zone_number(&self) -> ZoneNumber {
        ZoneNumber(self.start / self.zone_size)
    }

    /// Remaining usable bytes given the reported write pointer.
    ///
    /// Zero for conditions that can never be written.
    #[must_use]
    pub fn capacity_remaining(&self) -> u64 {
        if !self.condition.is_writable() {
            return 0;
        }
        self.max_capacity.saturating_sub(self.wp - self.start)
    }
}

/// Zoned model reported by the kernel for a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceModel {
    HostManaged,
    HostAware,
    NotZoned,
}

/// Static device geometry and quotas, fixed for the life of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub block_size: BlockSize,
    /// Zone size in bytes. Uniform across the device.
    pub zone_size: u64,
    pub nr_zones: u64,
    /// Device limit on zones in an active condition.
    pub max_active_zones: u32,
    /// Device limit on zones held open by the host.
    pub max_open_zones: u32,
    pub model: DeviceModel,
}

impl DeviceGeometry {
    /// Addressable span in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.nr_zones.saturating_mul(self.zone_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_rejects_non_power_of_two() {
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn block_size_accepts_common_sizes() {
        for sz in [512, 4096, 65536] {
            assert_eq!(BlockSize::new(sz).unwrap().get(), sz);
        }
    }

    #[test]
    fn block_size_alignment() {
        let bs = BlockSize::new(4096).unwrap();
        assert!(bs.is_aligned(0));
        assert!(bs.is_aligned(8192));
        assert!(!bs.is_aligned(4097));
    }

    #[test]
    fn lifetime_hint_orders_by_expected_lifetime() {
        assert!(LifetimeHint::Long > LifetimeHint::Short);
        assert!(LifetimeHint::Extreme > LifetimeHint::Medium);
        assert!(LifetimeHint::NotSet < LifetimeHint::None);
    }

    #[test]
    fn lifetime_hint_u8_roundtrip() {
        for hint in [
            LifetimeHint::NotSet,
            LifetimeHint::None,
            LifetimeHint::Short,
            LifetimeHint::Medium,
            LifetimeHint::Long,
            LifetimeHint::Extreme,
        ] {
            assert_eq!(LifetimeHint::from_u8(hint.as_u8()), hint);
        }
        assert_eq!(LifetimeHint::from_u8(250), LifetimeHint::NotSet);
    }

    #[test]
    fn condition_active_set() {
        assert!(ZoneCondition::ImplicitOpen.is_active());
        assert!(ZoneCondition::ExplicitOpen.is_active());
        assert!(ZoneCondition::Closed.is_active());
        assert!(!ZoneCondition::Empty.is_active());
        assert!(!ZoneCondition::Full.is_active());
        assert!(!ZoneCondition::Offline.is_active());
    }

    #[test]
    fn descriptor_capacity_remaining() {
        let mut desc = ZoneDescriptor {
            start: 1 << 20,
            zone_size: 1 << 20,
            max_capacity: 1 << 20,
            wp: (1 << 20) + 4096,
            zone_type: ZoneType::SequentialWriteRequired,
            condition: ZoneCondition::ImplicitOpen,
        };
        assert_eq!(desc.capacity_remaining(), (1 << 20) - 4096);
        assert_eq!(desc.zone_number(), ZoneNumber(1));

        desc.condition = ZoneCondition::Offline;
        assert_eq!(desc.capacity_remaining(), 0);
    }
}
