//! Per-array validity bitmap.

use std::fmt;

use hetarray_compute::{Location, HOST_SLOT, LOCATION_SLOTS};

/// One bit per [`Location`]; set when that location holds the current data.
///
/// After a write exactly one bit is set. A read refresh adds bits, so
/// several locations may share a read-only copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValidityMap(u64);

impl ValidityMap {
    /// No location valid.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Only the host valid (state of a freshly created root array).
    pub const fn host_only() -> Self {
        Self(1 << HOST_SLOT)
    }

    /// Only `location` valid.
    pub fn only(location: Location) -> Self {
        Self(1 << location.slot())
    }

    /// Raw bits.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Whether `location` holds the current data.
    pub fn is_valid(&self, location: Location) -> bool {
        self.0 & (1 << location.slot()) != 0
    }

    /// Mark `location` valid.
    pub fn set(&mut self, location: Location) {
        self.0 |= 1 << location.slot();
    }

    /// Mark `location` invalid.
    pub fn clear(&mut self, location: Location) {
        self.0 &= !(1 << location.slot());
    }

    /// Mark every location invalid.
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Write protocol: `location` becomes the exclusive owner.
    pub fn invalidate_all_except(&mut self, location: Location) {
        *self = Self::only(location);
    }

    /// Whether no location is valid.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of valid locations.
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether `location` is the single valid location.
    pub fn is_exclusive(&self, location: Location) -> bool {
        *self == Self::only(location)
    }

    /// Valid locations, devices in slot order, the host last.
    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        (0..LOCATION_SLOTS)
            .filter(move |slot| self.0 & (1 << slot) != 0)
            .filter_map(Location::from_slot)
    }

    /// First valid device, if any.
    pub fn first_device(&self) -> Option<Location> {
        self.locations().find(|loc| !loc.is_host())
    }
}

impl fmt::Debug for ValidityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.locations()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetarray_compute::DeviceId;

    const GPU0: Location = Location::Device(DeviceId::gpu(0));
    const GPU1: Location = Location::Device(DeviceId::gpu(1));

    #[test]
    fn test_shared_then_exclusive() {
        let mut map = ValidityMap::host_only();
        map.set(GPU0);
        map.set(GPU1);
        assert_eq!(map.count(), 3);

        map.invalidate_all_except(GPU1);
        assert!(map.is_exclusive(GPU1));
        assert!(!map.is_valid(Location::Host));
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn test_locations_order() {
        let mut map = ValidityMap::host_only();
        map.set(GPU1);
        map.set(GPU0);
        let locs: Vec<_> = map.locations().collect();
        assert_eq!(locs, vec![GPU0, GPU1, Location::Host]);
        assert_eq!(map.first_device(), Some(GPU0));
    }

    #[test]
    fn test_clear() {
        let mut map = ValidityMap::only(GPU0);
        map.clear(GPU0);
        assert!(map.is_empty());
        assert_eq!(map.first_device(), None);
        assert_eq!(format!("{:?}", ValidityMap::host_only()), "{Host}");
    }
}
