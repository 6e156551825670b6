//! Memory locations: the host, or one attached device.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{DeviceId, DeviceKind, MAX_DEVICES_PER_KIND};

/// Slot reserved for the host. Every device slot is strictly smaller.
pub const HOST_SLOT: usize = 63;

/// Number of addressable slots, host included.
pub const LOCATION_SLOTS: usize = HOST_SLOT + 1;

/// A physical memory space an array copy can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Location {
    /// Device memory of one attached device.
    Device(DeviceId),
    /// Host memory.
    Host,
}

impl Location {
    /// Dense slot number; the host is always [`HOST_SLOT`].
    pub fn slot(&self) -> usize {
        match self {
            Location::Host => HOST_SLOT,
            Location::Device(id) => id.slot(),
        }
    }

    /// Inverse of [`slot`](Self::slot).
    pub fn from_slot(slot: usize) -> Option<Self> {
        if slot == HOST_SLOT {
            return Some(Location::Host);
        }
        let per_kind = MAX_DEVICES_PER_KIND as usize;
        let per_platform = DeviceKind::COUNT as usize * per_kind;
        let kind = *DeviceKind::ALL.get((slot % per_platform) / per_kind)?;
        let platform = u8::try_from(slot / per_platform).ok()?;
        let index = (slot % per_kind) as u8;
        DeviceId::new(platform, kind, index).ok().map(Location::Device)
    }

    /// Check if this is the host.
    pub fn is_host(&self) -> bool {
        matches!(self, Location::Host)
    }

    /// The device, unless this is the host.
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Location::Host => None,
            Location::Device(id) => Some(*id),
        }
    }
}

impl From<DeviceId> for Location {
    fn from(id: DeviceId) -> Self {
        Location::Device(id)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Device(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_is_max_slot() {
        assert_eq!(Location::Host.slot(), HOST_SLOT);
        assert!(Location::Device(DeviceId::gpu(4).on_platform(3)).slot() < HOST_SLOT);
    }

    #[test]
    fn test_slot_round_trip() {
        let gpu = Location::Device(DeviceId::accelerator(3).on_platform(2));
        assert_eq!(Location::from_slot(gpu.slot()), Some(gpu));
        assert_eq!(Location::from_slot(HOST_SLOT), Some(Location::Host));
        assert_eq!(Location::from_slot(62), None);
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::Host.to_string(), "host");
        assert_eq!(Location::from(DeviceId::gpu(1)).to_string(), "p0:GPU:1");
        assert_eq!(Location::from(DeviceId::gpu(1)).device(), Some(DeviceId::gpu(1)));
        assert_eq!(Location::Host.device(), None);
    }
}
