//! Buffer allocator and LRU evictor.

use hetarray_compute::{ComputeBackend, DeviceId, Location};

use crate::array::ArrayId;
use crate::buffers::BufferSlot;
use crate::engine::{backend_err, Coherence};
use crate::error::{CoherenceError, CoherenceResult};

impl<B: ComputeBackend> Coherence<B> {
    /// Make sure `id` holds a buffer at `device`.
    ///
    /// A child whose region is one contiguous, aligned range of its parent's
    /// owned buffer aliases it; everything else gets its own allocation,
    /// evicting least-recently-used buffers when the device is full.
    pub(crate) fn ensure_buffer(&mut self, id: ArrayId, device: DeviceId) -> CoherenceResult<()> {
        if let Some(slot) = self.entry(id)?.buffers.get(device) {
            if !slot.is_sub() {
                self.lru.touch(device, id);
            }
            return Ok(());
        }

        if let Some(sub) = self.try_sub_buffer(id, device)? {
            self.arrays
                .get_mut(id)?
                .buffers
                .insert(device, BufferSlot::Sub(sub));
            self.stats.sub_buffers_created += 1;
            tracing::debug!("Aliased {} into its parent's buffer at {}", id, device);
            return Ok(());
        }

        let size = self.entry(id)?.desc.byte_len();
        let buffer = self.allocate_evicting(id, device, size)?;
        self.arrays
            .get_mut(id)?
            .buffers
            .insert(device, BufferSlot::Owned(buffer));
        self.lru.touch(device, id);
        tracing::trace!("Allocated {} bytes for {} at {}", size, id, device);
        Ok(())
    }

    fn try_sub_buffer(&self, id: ArrayId, device: DeviceId) -> CoherenceResult<Option<B::Buffer>> {
        if !self.config.sub_buffers {
            return Ok(None);
        }
        let entry = self.entry(id)?;
        let (parent_id, region) = match (entry.parent, entry.region.as_ref()) {
            (Some(parent), Some(region)) => (parent, region),
            _ => return Ok(None),
        };
        let parent = self.entry(parent_id)?;
        // Aliases of overlapping siblings would share their halo cells.
        if parent.registry.has_links(id) {
            return Ok(None);
        }
        let Some(parent_buffer) = parent.buffers.owned(device) else {
            return Ok(None);
        };
        if !region.is_contiguous_in(&parent.desc.shape) {
            return Ok(None);
        }
        let offset = region.byte_offset_in(&parent.desc.shape, parent.desc.elem_size);
        if offset % self.backend.sub_buffer_alignment(device) != 0 {
            return Ok(None);
        }

        self.backend
            .allocate_sub_buffer(parent_buffer, offset, entry.desc.byte_len())
            .map(Some)
            .map_err(backend_err("allocate_sub_buffer"))
    }

    /// Allocate, evicting over a snapshot of the LRU queue until the
    /// allocation fits or no candidate is left.
    fn allocate_evicting(
        &mut self,
        requester: ArrayId,
        device: DeviceId,
        size: usize,
    ) -> CoherenceResult<B::Buffer> {
        let candidates = self.lru.snapshot(device);
        let mut next = 0;

        loop {
            match self.backend.allocate_buffer(device, size) {
                Ok(buffer) => return Ok(buffer),
                Err(err) if err.is_out_of_memory() => {
                    let victim = loop {
                        let Some(&candidate) = candidates.get(next) else {
                            tracing::warn!(
                                "Nothing left to evict at {} for {} bytes",
                                device,
                                size
                            );
                            return Err(CoherenceError::EvictionExhausted {
                                location: Location::Device(device),
                                requested: size,
                            });
                        };
                        next += 1;
                        if candidate != requester && self.is_evictable(candidate, device) {
                            break candidate;
                        }
                    };
                    self.evict(victim, device)?;
                }
                Err(err) => return Err(backend_err("allocate")(err)),
            }
        }
    }

    /// Whether `id`'s owned buffer at `device` may be released now.
    fn is_evictable(&self, id: ArrayId, device: DeviceId) -> bool {
        let Ok(entry) = self.entry(id) else {
            return false;
        };
        if entry.buffers.owned(device).is_none() || self.pins.is_pinned(id) {
            return false;
        }
        // A pinned child aliasing this buffer keeps it alive.
        entry.registry.children().into_iter().all(|child| {
            let aliased = self
                .entry(child)
                .map(|c| c.buffers.get(device).map_or(false, BufferSlot::is_sub))
                .unwrap_or(false);
            !(aliased && self.pins.is_pinned(child))
        })
    }

    /// Release `victim`'s buffer at `device`, together with the sub-buffers
    /// of its children there.
    pub(crate) fn evict(&mut self, victim: ArrayId, device: DeviceId) -> CoherenceResult<()> {
        for child in self.entry(victim)?.registry.children() {
            if self
                .entry(child)?
                .buffers
                .get(device)
                .map_or(false, BufferSlot::is_sub)
            {
                self.release_at(child, device)?;
            }
        }
        self.release_at(victim, device)?;
        self.stats.evictions += 1;
        tracing::info!("Evicted {} from {}", victim, device);
        Ok(())
    }

    /// Release one buffer, flushing to the host first when the buffer holds
    /// data that exists nowhere else.
    fn release_at(&mut self, id: ArrayId, device: DeviceId) -> CoherenceResult<()> {
        let location = Location::Device(device);
        let entry = self.entry(id)?;
        let sole_copy = entry.validity.is_exclusive(location);
        let rebuild_base = entry.validity.is_empty() && entry.rebuild_base == Some(location);
        if (sole_copy || rebuild_base) && !self.is_disabled(id)? {
            tracing::debug!("Flushing {} from {} to host before release", id, device);
            self.refresh(id, Location::Host)?;
        }

        let Some(slot) = self.entry(id)?.buffers.get(device) else {
            return Ok(());
        };
        let is_sub = slot.is_sub();
        self.backend
            .release_buffer(slot.buffer().clone())
            .map_err(backend_err("release"))?;

        let entry = self.arrays.get_mut(id)?;
        entry.buffers.take(device);
        entry.validity.clear(location);
        if entry.rebuild_base == Some(location) {
            entry.rebuild_base = None;
        }
        if !is_sub {
            self.lru.remove(device, id);
        }
        Ok(())
    }

    /// Release every buffer at `device` not needed by a pinned array,
    /// flushing sole copies to the host. Returns the number of arrays
    /// evicted.
    pub fn evict_device(&mut self, device: DeviceId) -> CoherenceResult<usize> {
        self.check_location(Location::Device(device))?;
        let mut evicted = 0;
        for id in self.lru.snapshot(device) {
            if self.is_evictable(id, device) {
                self.evict(id, device)?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use crate::{AccessIntent, Coherence, CoherenceError, Region};
    use hetarray_compute::{DeviceId, EmulatedBackend, EmulatedDevice, Location};

    const GPU0: DeviceId = DeviceId::gpu(0);

    fn engine(capacity: u64, alignment: usize) -> Coherence<EmulatedBackend> {
        let backend = EmulatedBackend::new(vec![
            EmulatedDevice::new(GPU0, capacity).with_alignment(alignment)
        ])
        .unwrap();
        Coherence::new(backend)
    }

    #[test]
    fn test_lru_eviction_flushes_sole_copy() {
        // Room for two 64-byte arrays.
        let mut engine = engine(128, 1);
        let a = engine.create_from(&[16], &[1.0f32; 16]).unwrap();
        let b = engine.create_from(&[16], &[2.0f32; 16]).unwrap();
        let c = engine.create_from(&[16], &[3.0f32; 16]).unwrap();

        engine.ensure_valid(a, GPU0.into(), AccessIntent::ReadWrite).unwrap();
        engine.commit_write(a, GPU0.into()).unwrap();
        engine.ensure_valid(b, GPU0.into(), AccessIntent::ReadOnly).unwrap();

        // `a` is least recently used and only valid on the device.
        engine.ensure_valid(c, GPU0.into(), AccessIntent::ReadOnly).unwrap();
        assert!(!engine.has_buffer(a, GPU0).unwrap());
        assert_eq!(engine.valid_locations(a).unwrap(), vec![Location::Host]);
        assert_eq!(engine.host_read_as::<f32>(a).unwrap(), vec![1.0; 16]);
        assert_eq!(engine.lru_order(GPU0), vec![b, c]);
        assert_eq!(engine.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_exhausted_when_all_pinned() {
        let mut engine = engine(64, 1);
        let a = engine.create_from(&[16], &[1.0f32; 16]).unwrap();
        let b = engine.create_from(&[16], &[2.0f32; 16]).unwrap();

        let err = engine
            .prepare_invocation(GPU0, &[(a, AccessIntent::ReadOnly), (b, AccessIntent::ReadOnly)])
            .unwrap_err();
        assert!(matches!(err, CoherenceError::EvictionExhausted { .. }));
        assert!(err.is_fatal());

        // The failed prepare released its pins; `a` can now be evicted.
        engine.ensure_valid(b, GPU0.into(), AccessIntent::ReadOnly).unwrap();
        assert!(!engine.has_buffer(a, GPU0).unwrap());
    }

    #[test]
    fn test_contiguous_child_gets_sub_buffer() {
        let mut engine = engine(1 << 16, 16);
        let parent = engine.create_from(&[8, 8], &[0u32; 64]).unwrap();
        // Rows 2..=3: offset 64 bytes, aligned.
        let rows = engine
            .register_child(parent, Region::new(&[2, 0], &[3, 7]).unwrap())
            .unwrap();
        // Column block: not contiguous.
        let cols = engine
            .register_child(parent, Region::new(&[4, 0], &[7, 3]).unwrap())
            .unwrap();
        // Single row starting at element 1: misaligned.
        let skew = engine
            .register_child(parent, Region::new(&[0, 1], &[0, 4]).unwrap())
            .unwrap();

        engine.ensure_valid(parent, GPU0.into(), AccessIntent::ReadOnly).unwrap();
        for child in [rows, cols, skew] {
            engine.ensure_valid(child, GPU0.into(), AccessIntent::ReadOnly).unwrap();
        }

        assert!(engine.is_sub_buffer(rows, GPU0).unwrap());
        assert!(!engine.is_sub_buffer(cols, GPU0).unwrap());
        assert!(!engine.is_sub_buffer(skew, GPU0).unwrap());
        assert_eq!(engine.stats().sub_buffers_created, 1);
        assert_eq!(engine.lru_order(GPU0).len(), 3);
    }

    #[test]
    fn test_evicting_parent_releases_child_sub_buffers() {
        let mut engine = engine(1 << 16, 1);
        let parent = engine.create_from(&[16], &[5u32; 16]).unwrap();
        let child = engine
            .register_child(parent, Region::new(&[0], &[7]).unwrap())
            .unwrap();

        engine.ensure_valid(parent, GPU0.into(), AccessIntent::ReadOnly).unwrap();
        engine.ensure_valid(child, GPU0.into(), AccessIntent::ReadWrite).unwrap();
        engine.commit_write(child, GPU0.into()).unwrap();

        assert_eq!(engine.evict_device(GPU0).unwrap(), 1);
        assert!(!engine.has_buffer(child, GPU0).unwrap());
        assert!(!engine.has_buffer(parent, GPU0).unwrap());
        // The child's write survived on the host.
        assert_eq!(engine.valid_locations(child).unwrap(), vec![Location::Host]);
        assert_eq!(engine.host_read_as::<u32>(parent).unwrap(), vec![5u32; 16]);
    }
}
