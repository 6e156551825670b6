//! Device buffer table.

use std::collections::BTreeMap;

use hetarray_compute::DeviceId;

/// Buffer an array holds at one device.
#[derive(Debug, Clone)]
pub enum BufferSlot<Buf> {
    /// Allocation owned by the array.
    Owned(Buf),
    /// Alias of the parent's owned buffer at the same device.
    Sub(Buf),
}

impl<Buf> BufferSlot<Buf> {
    /// The buffer handle.
    pub fn buffer(&self) -> &Buf {
        match self {
            BufferSlot::Owned(buf) | BufferSlot::Sub(buf) => buf,
        }
    }

    /// Whether this is a sub-buffer.
    pub fn is_sub(&self) -> bool {
        matches!(self, BufferSlot::Sub(_))
    }

    /// Consume the slot.
    pub fn into_buffer(self) -> Buf {
        match self {
            BufferSlot::Owned(buf) | BufferSlot::Sub(buf) => buf,
        }
    }
}

/// Per-device buffers of one array.
#[derive(Debug)]
pub(crate) struct DeviceBufferTable<Buf> {
    slots: BTreeMap<DeviceId, BufferSlot<Buf>>,
}

impl<Buf> Default for DeviceBufferTable<Buf> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }
}

impl<Buf> DeviceBufferTable<Buf> {
    pub fn get(&self, device: DeviceId) -> Option<&BufferSlot<Buf>> {
        self.slots.get(&device)
    }

    pub fn insert(&mut self, device: DeviceId, slot: BufferSlot<Buf>) {
        self.slots.insert(device, slot);
    }

    pub fn take(&mut self, device: DeviceId) -> Option<BufferSlot<Buf>> {
        self.slots.remove(&device)
    }

    pub fn owned(&self, device: DeviceId) -> Option<&Buf> {
        match self.slots.get(&device) {
            Some(BufferSlot::Owned(buf)) => Some(buf),
            _ => None,
        }
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.slots.keys().copied().collect()
    }

    /// Remove every slot, sub-buffers first.
    pub fn drain(&mut self) -> Vec<(DeviceId, BufferSlot<Buf>)> {
        let mut slots: Vec<_> = std::mem::take(&mut self.slots).into_iter().collect();
        slots.sort_by_key(|(_, slot)| !slot.is_sub());
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_table() {
        let mut table = DeviceBufferTable::default();
        table.insert(DeviceId::gpu(1), BufferSlot::Owned(1u32));
        table.insert(DeviceId::gpu(0), BufferSlot::Sub(2u32));

        assert_eq!(table.owned(DeviceId::gpu(1)), Some(&1));
        assert_eq!(table.owned(DeviceId::gpu(0)), None);
        assert!(table.get(DeviceId::gpu(0)).unwrap().is_sub());
        assert_eq!(table.devices(), vec![DeviceId::gpu(0), DeviceId::gpu(1)]);

        let drained = table.drain();
        assert!(drained[0].1.is_sub());
        assert!(table.devices().is_empty());
    }
}
