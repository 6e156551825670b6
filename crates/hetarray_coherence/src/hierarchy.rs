//! Child registration and array teardown.

use hetarray_compute::{ComputeBackend, Location};

use crate::array::{ArrayDesc, ArrayEntry, ArrayId};
use crate::engine::{backend_err, Coherence};
use crate::error::{CoherenceError, CoherenceResult};
use crate::region::Region;

impl<B: ComputeBackend> Coherence<B> {
    /// Carve a child out of `region` of `parent`.
    ///
    /// The child starts invalid everywhere and derives its contents from
    /// the parent on first access. Registering a region twice returns the
    /// existing child. A region overlapping a sibling must share a halo
    /// band with it along a single axis; the siblings are then linked for
    /// ghost synchronization.
    pub fn register_child(&mut self, parent: ArrayId, region: Region) -> CoherenceResult<ArrayId> {
        self.resolve_disables(parent)?;
        if self.config.sync_ghost_on_register {
            self.sync_ghost(parent)?;
        }

        let entry = self.entry(parent)?;
        if !region.fits_within(&entry.desc.shape) {
            return Err(CoherenceError::violation(format!(
                "region {} does not fit in {} of shape {:?}",
                region, parent, entry.desc.shape
            )));
        }
        if let Some(existing) = entry.registry.get(&region) {
            return Ok(existing);
        }
        let desc = ArrayDesc::new(entry.desc.elem_size, &region.extent())?;

        let child = self
            .arrays
            .insert(ArrayEntry::child(desc, parent, region.clone()));
        let links = match self.entry(parent)?.registry.plan_links(child, &region) {
            Ok(links) => links,
            Err(err) => {
                self.arrays.remove(child)?;
                return Err(err);
            }
        };

        let linked = links.len();
        let entry = self.arrays.get_mut(parent)?;
        entry
            .registry
            .insert(region.clone(), child, links, &entry.desc.shape);
        tracing::debug!(
            "Registered {} at {} of {} ({} ghost links)",
            child,
            region,
            parent,
            linked
        );
        Ok(child)
    }

    /// Destroy an array and, first, all of its children.
    ///
    /// A child's unpropagated write is folded into its parent before the
    /// child goes away. An [`External`](crate::StorageClass::External) root
    /// is brought up to date on the host and its bytes are handed back.
    pub fn destroy(&mut self, id: ArrayId) -> CoherenceResult<Option<Vec<u8>>> {
        if let Some(parent) = self.entry(id)?.parent {
            if self.effective_updated(id)? && self.effective_validity(parent)?.is_empty() {
                tracing::debug!("Folding {} into {} before destroy", id, parent);
                self.refresh(parent, Location::Host)?;
            }
        }

        let external = self.is_external(id)?;
        if external {
            self.refresh(id, Location::Host)?;
        }

        let entry = self.destroy_tree(id)?;
        tracing::debug!("Destroyed {}", id);
        Ok(external.then_some(entry.host))
    }

    /// Destroy a child array. Fails for a root.
    pub fn destroy_child(&mut self, child: ArrayId) -> CoherenceResult<()> {
        if self.entry(child)?.parent.is_none() {
            return Err(CoherenceError::violation(format!(
                "{} is a root array, not a child",
                child
            )));
        }
        self.destroy(child).map(|_| ())
    }

    fn destroy_tree(&mut self, id: ArrayId) -> CoherenceResult<ArrayEntry<B::Buffer>> {
        for child in self.entry(id)?.registry.children() {
            self.destroy_tree(child)?;
        }

        let mut entry = self.arrays.remove(id)?;
        let mut first_error = None;
        for (device, slot) in entry.buffers.drain() {
            if !slot.is_sub() {
                self.lru.remove(device, id);
            }
            if let Err(err) = self.backend.release_buffer(slot.into_buffer()) {
                first_error.get_or_insert(backend_err("release")(err));
            }
        }

        if let Some(parent) = entry.parent {
            if let Ok(parent) = self.arrays.get_mut(parent) {
                parent.registry.remove(id, &parent.desc.shape);
            }
        }
        self.pins.unpin(id);

        match first_error {
            Some(err) => Err(err),
            None => Ok(entry),
        }
    }
}
