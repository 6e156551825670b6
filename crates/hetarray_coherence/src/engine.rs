//! The coherency controller.
//!
//! [`Coherence`] owns every logical array and the device buffers backing
//! them. Reads go through the refresh protocol ([`Coherence::ensure_valid`]),
//! writes through the write protocol ([`Coherence::commit_write`]); both are
//! aware of the parent/child hierarchy.

use hetarray_compute::{
    copy_rect, row_pairs, ComputeBackend, ComputeError, CopyRect, DeviceId, Location, RectLayout,
    TransferDirection,
};

use crate::array::{ArrayDesc, ArrayEntry, ArrayId, Arena, StorageClass};
use crate::buffers::BufferSlot;
use crate::config::CoherenceConfig;
use crate::error::{CoherenceError, CoherenceResult};
use crate::intent::AccessIntent;
use crate::lru::{LruQueues, PinSet};
use crate::region::{dense_layout, Region};
use crate::registry::OverlapLink;
use crate::state::{
    classify, plan_refresh, rebuild_base_after_child_write, CoherenceState, RebuildKind,
    RefreshInputs, RefreshPlan,
};
use crate::stats::CoherenceStats;
use crate::validity::ValidityMap;

/// Map a backend error raised during `operation`, logging it.
pub(crate) fn backend_err(operation: &'static str) -> impl FnOnce(ComputeError) -> CoherenceError {
    move |err| {
        tracing::warn!("Backend failure in {}: {}", operation, err);
        CoherenceError::backend(operation, err)
    }
}

/// Host/device coherency engine.
///
/// All state mutation takes `&mut self`; share an engine across threads
/// behind a lock.
pub struct Coherence<B: ComputeBackend> {
    pub(crate) backend: B,
    pub(crate) config: CoherenceConfig,
    pub(crate) arrays: Arena<B::Buffer>,
    pub(crate) lru: LruQueues,
    pub(crate) pins: PinSet,
    pub(crate) stats: CoherenceStats,
    epoch: u64,
}

impl<B: ComputeBackend> Coherence<B> {
    /// Create an engine with the default configuration.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, CoherenceConfig::default())
    }

    /// Create an engine with `config`.
    pub fn with_config(backend: B, config: CoherenceConfig) -> Self {
        tracing::debug!(
            "Coherence engine on {} backend with {} devices",
            backend.name(),
            backend.devices().len()
        );
        Self {
            backend,
            config,
            arrays: Arena::default(),
            lru: LruQueues::default(),
            pins: PinSet::default(),
            stats: CoherenceStats::default(),
            epoch: 0,
        }
    }

    /// The device backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Active configuration.
    pub fn config(&self) -> &CoherenceConfig {
        &self.config
    }

    /// Counters since creation or the last reset.
    pub fn stats(&self) -> &CoherenceStats {
        &self.stats
    }

    /// Reset the counters.
    pub fn reset_stats(&mut self) {
        self.stats = CoherenceStats::default();
    }

    /// Number of live arrays, children included.
    pub fn array_count(&self) -> usize {
        self.arrays.len()
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a zero-filled root array, valid on the host.
    pub fn create(&mut self, desc: ArrayDesc) -> ArrayId {
        let host = vec![0u8; desc.byte_len()];
        let id = self.arrays.insert(ArrayEntry::root(desc, host));
        tracing::debug!("Created {}", id);
        id
    }

    /// Create a root array over caller-provided host bytes.
    ///
    /// With [`StorageClass::External`] the bytes are handed back by
    /// [`destroy`](Self::destroy).
    pub fn create_with_data(&mut self, desc: ArrayDesc, data: Vec<u8>) -> CoherenceResult<ArrayId> {
        if data.len() != desc.byte_len() {
            return Err(CoherenceError::violation(format!(
                "{} bytes supplied for an array of {} bytes",
                data.len(),
                desc.byte_len()
            )));
        }
        let id = self.arrays.insert(ArrayEntry::root(desc, data));
        tracing::debug!("Created {} over supplied storage", id);
        Ok(id)
    }

    /// Create a root array of `shape` initialised from `data`.
    pub fn create_from<T: bytemuck::Pod>(
        &mut self,
        shape: &[usize],
        data: &[T],
    ) -> CoherenceResult<ArrayId> {
        let desc = ArrayDesc::of::<T>(shape)?;
        self.create_with_data(desc, bytemuck::cast_slice(data).to_vec())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Static description of an array.
    pub fn desc(&self, id: ArrayId) -> CoherenceResult<&ArrayDesc> {
        Ok(&self.entry(id)?.desc)
    }

    /// Parent of a child array.
    pub fn parent(&self, id: ArrayId) -> CoherenceResult<Option<ArrayId>> {
        Ok(self.entry(id)?.parent)
    }

    /// Placement of a child inside its parent.
    pub fn region(&self, id: ArrayId) -> CoherenceResult<Option<&Region>> {
        Ok(self.entry(id)?.region.as_ref())
    }

    /// Registered children, in region order.
    pub fn children(&self, id: ArrayId) -> CoherenceResult<Vec<ArrayId>> {
        Ok(self.entry(id)?.registry.children())
    }

    /// Ghost links between the children of `parent`.
    pub fn overlap_links(&self, parent: ArrayId) -> CoherenceResult<Vec<OverlapLink>> {
        Ok(self.entry(parent)?.registry.links().to_vec())
    }

    /// Whether the children of `parent` tile it exactly.
    pub fn children_totally_cover(&self, parent: ArrayId) -> CoherenceResult<bool> {
        Ok(self.entry(parent)?.registry.totally_cover)
    }

    /// Current state in the coherence state machine.
    pub fn coherence_state(&self, id: ArrayId) -> CoherenceResult<CoherenceState> {
        Ok(classify(&self.refresh_inputs(id, Location::Host)?))
    }

    /// Locations holding the current data.
    pub fn valid_locations(&self, id: ArrayId) -> CoherenceResult<Vec<Location>> {
        Ok(self.effective_validity(id)?.locations().collect())
    }

    /// Whether `location` holds the current data.
    pub fn is_valid(&self, id: ArrayId, location: Location) -> CoherenceResult<bool> {
        Ok(self.effective_validity(id)?.is_valid(location))
    }

    /// Whether the array has been written since it was last invalidated
    /// through its parent.
    pub fn is_updated(&self, id: ArrayId) -> CoherenceResult<bool> {
        self.effective_updated(id)
    }

    /// Whether the array holds a buffer at `device`.
    pub fn has_buffer(&self, id: ArrayId, device: DeviceId) -> CoherenceResult<bool> {
        Ok(self.entry(id)?.buffers.get(device).is_some())
    }

    /// Whether the array's buffer at `device` aliases its parent's.
    pub fn is_sub_buffer(&self, id: ArrayId, device: DeviceId) -> CoherenceResult<bool> {
        Ok(self
            .entry(id)?
            .buffers
            .get(device)
            .map_or(false, BufferSlot::is_sub))
    }

    /// The array's buffer at `device`, if any.
    pub fn buffer(&self, id: ArrayId, device: DeviceId) -> CoherenceResult<Option<&B::Buffer>> {
        Ok(self.entry(id)?.buffers.get(device).map(BufferSlot::buffer))
    }

    /// Arrays owning a buffer at `device`, least recently used first.
    pub fn lru_order(&self, device: DeviceId) -> Vec<ArrayId> {
        self.lru.snapshot(device)
    }

    // ------------------------------------------------------------------
    // Access protocol
    // ------------------------------------------------------------------

    /// Prepare `id` for access at `location` with `intent`.
    ///
    /// Reading intents make `location` valid. `WriteOnly` only makes sure a
    /// buffer exists, since the contents are about to be overwritten.
    pub fn ensure_valid(
        &mut self,
        id: ArrayId,
        location: Location,
        intent: AccessIntent,
    ) -> CoherenceResult<()> {
        self.check_location(location)?;
        self.entry(id)?;

        match intent {
            AccessIntent::None => Ok(()),
            AccessIntent::WriteOnly => {
                self.resolve_disables(id)?;
                match location {
                    Location::Host => Ok(()),
                    Location::Device(device) => {
                        self.with_pins(id, |this| this.ensure_buffer(id, device))
                    }
                }
            }
            AccessIntent::ReadOnly | AccessIntent::ReadWrite => self.refresh(id, location),
        }
    }

    /// Record that `id` was written at `location`.
    ///
    /// `location` becomes the only valid copy. Children of `id` become stale,
    /// and every ancestor is invalidated until rebuilt from its children.
    pub fn commit_write(&mut self, id: ArrayId, location: Location) -> CoherenceResult<()> {
        self.check_location(location)?;
        self.resolve_disables(id)?;

        if let Location::Device(device) = location {
            if self.entry(id)?.buffers.get(device).is_none() {
                return Err(CoherenceError::violation(format!(
                    "write of {} committed at {} where it has no buffer",
                    id, location
                )));
            }
        }

        let linked = match self.entry(id)?.parent {
            Some(parent) => self.entry(parent)?.registry.has_links(id),
            None => false,
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let entry = self.arrays.get_mut(id)?;
        entry.validity.invalidate_all_except(location);
        entry.updated = true;
        entry.rebuild_base = None;
        entry.ghost_dirty = linked;
        entry.write_epoch = epoch;
        if entry.has_children() {
            entry.registry.children_disabled = true;
        }

        self.mark_ancestors_stale(id)?;
        self.touch(id, location);
        tracing::debug!("Committed write of {} at {}", id, location);
        Ok(())
    }

    /// Host bytes of `id`, refreshed from wherever the current data is.
    pub fn host_read(&mut self, id: ArrayId) -> CoherenceResult<&[u8]> {
        self.refresh(id, Location::Host)?;
        Ok(self.entry(id)?.host.as_slice())
    }

    /// Mutable host bytes of `id`. The host becomes the only valid copy.
    pub fn host_write(&mut self, id: ArrayId) -> CoherenceResult<&mut [u8]> {
        self.refresh(id, Location::Host)?;
        self.commit_write(id, Location::Host)?;
        Ok(self.arrays.get_mut(id)?.host.as_mut_slice())
    }

    /// Host contents of `id` as typed elements.
    pub fn host_read_as<T: bytemuck::Pod>(&mut self, id: ArrayId) -> CoherenceResult<Vec<T>> {
        self.check_element::<T>(id)?;
        Ok(bytemuck::pod_collect_to_vec(self.host_read(id)?))
    }

    /// Overwrite `id` from the host with `data`.
    pub fn host_write_from<T: bytemuck::Pod>(
        &mut self,
        id: ArrayId,
        data: &[T],
    ) -> CoherenceResult<()> {
        self.check_element::<T>(id)?;
        let len = self.entry(id)?.desc.len();
        if data.len() != len {
            return Err(CoherenceError::violation(format!(
                "{} elements written into {} of {} elements",
                data.len(),
                id,
                len
            )));
        }
        self.commit_write(id, Location::Host)?;
        self.arrays
            .get_mut(id)?
            .host
            .copy_from_slice(bytemuck::cast_slice(data));
        Ok(())
    }

    /// Update `id` in place on the host.
    pub fn host_update<T, F>(&mut self, id: ArrayId, f: F) -> CoherenceResult<()>
    where
        T: bytemuck::Pod,
        F: FnOnce(&mut [T]),
    {
        let mut elements = self.host_read_as::<T>(id)?;
        f(&mut elements);
        self.commit_write(id, Location::Host)?;
        self.arrays
            .get_mut(id)?
            .host
            .copy_from_slice(bytemuck::cast_slice(&elements));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    pub(crate) fn entry(&self, id: ArrayId) -> CoherenceResult<&ArrayEntry<B::Buffer>> {
        self.arrays.get(id)
    }

    pub(crate) fn check_location(&self, location: Location) -> CoherenceResult<()> {
        match location {
            Location::Device(device) if !self.backend.has_device(device) => Err(
                CoherenceError::Configuration(format!("no device {} present", device)),
            ),
            _ => Ok(()),
        }
    }

    fn check_element<T>(&self, id: ArrayId) -> CoherenceResult<()> {
        let elem_size = self.entry(id)?.desc.elem_size;
        if elem_size != std::mem::size_of::<T>() {
            return Err(CoherenceError::violation(format!(
                "{} has {}-byte elements, accessed as {}-byte elements",
                id,
                elem_size,
                std::mem::size_of::<T>()
            )));
        }
        Ok(())
    }

    /// Ancestors of `id`, nearest first.
    pub(crate) fn ancestors(&self, id: ArrayId) -> CoherenceResult<Vec<ArrayId>> {
        let mut ancestors = Vec::new();
        let mut current = self.entry(id)?.parent;
        while let Some(parent) = current {
            ancestors.push(parent);
            current = self.entry(parent)?.parent;
        }
        Ok(ancestors)
    }

    /// Whether an ancestor gained exclusive ownership that has not been
    /// propagated to `id` yet.
    pub(crate) fn is_disabled(&self, id: ArrayId) -> CoherenceResult<bool> {
        for ancestor in self.ancestors(id)? {
            if self.entry(ancestor)?.registry.children_disabled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) fn effective_validity(&self, id: ArrayId) -> CoherenceResult<ValidityMap> {
        if self.is_disabled(id)? {
            return Ok(ValidityMap::empty());
        }
        Ok(self.entry(id)?.validity)
    }

    pub(crate) fn effective_updated(&self, id: ArrayId) -> CoherenceResult<bool> {
        Ok(self.entry(id)?.updated && !self.is_disabled(id)?)
    }

    /// Run `f` with `id` and its ancestors protected from eviction.
    pub(crate) fn with_pins<T>(
        &mut self,
        id: ArrayId,
        f: impl FnOnce(&mut Self) -> CoherenceResult<T>,
    ) -> CoherenceResult<T> {
        let ancestors = self.ancestors(id)?;
        self.pins.enter(id, &ancestors);
        let result = f(self);
        self.pins.leave();
        result
    }

    /// Propagate pending `children_disabled` flags from the root down to
    /// the children of `id`.
    pub(crate) fn resolve_disables(&mut self, id: ArrayId) -> CoherenceResult<()> {
        let mut path = self.ancestors(id)?;
        path.reverse();
        path.push(id);

        for node in path {
            if !self.entry(node)?.registry.children_disabled {
                continue;
            }
            let children = self.entry(node)?.registry.children();
            self.arrays.get_mut(node)?.registry.children_disabled = false;
            for child in &children {
                let entry = self.arrays.get_mut(*child)?;
                entry.validity.clear_all();
                entry.updated = false;
                entry.rebuild_base = None;
                entry.ghost_dirty = false;
                if entry.has_children() {
                    entry.registry.children_disabled = true;
                }
            }
            tracing::debug!("Invalidated {} children of {}", children.len(), node);
        }
        Ok(())
    }

    /// Invalidate every ancestor of a freshly written array.
    pub(crate) fn mark_ancestors_stale(&mut self, id: ArrayId) -> CoherenceResult<()> {
        let mut current = self.entry(id)?.parent;
        while let Some(ancestor) = current {
            let entry = self.arrays.get_mut(ancestor)?;
            entry.rebuild_base = rebuild_base_after_child_write(entry.validity, entry.rebuild_base);
            entry.validity.clear_all();
            if entry.parent.is_some() {
                entry.updated = true;
            }
            current = entry.parent;
        }
        Ok(())
    }

    /// Mark the owner of the memory backing `id` at `location` as used.
    pub(crate) fn touch(&mut self, id: ArrayId, location: Location) {
        let Location::Device(device) = location else {
            return;
        };
        let owner = match self.arrays.get(id) {
            Ok(entry) => match entry.buffers.get(device) {
                Some(BufferSlot::Owned(_)) => Some(id),
                Some(BufferSlot::Sub(_)) => entry.parent,
                None => None,
            },
            Err(_) => None,
        };
        if let Some(owner) = owner {
            self.lru.touch(device, owner);
        }
    }

    fn mark_valid(&mut self, id: ArrayId, location: Location) -> CoherenceResult<()> {
        self.arrays.get_mut(id)?.validity.set(location);
        self.touch(id, location);
        Ok(())
    }

    pub(crate) fn refresh_inputs(
        &self,
        id: ArrayId,
        target: Location,
    ) -> CoherenceResult<RefreshInputs> {
        let entry = self.entry(id)?;
        let validity = self.effective_validity(id)?;

        let parent_valid_at_target = match entry.parent {
            Some(parent) => self.effective_validity(parent)?.is_valid(target),
            None => false,
        };

        let children = entry.registry.children();
        let mut children_rebuild_all = entry.registry.totally_cover && !children.is_empty();
        for child in &children {
            if !children_rebuild_all {
                break;
            }
            children_rebuild_all = self.effective_updated(*child)?;
        }

        let mut direct_sources = ValidityMap::empty();
        if let (Location::Device(dst), true) = (target, self.config.direct_device_copy) {
            for src in validity.locations() {
                if let Location::Device(src_device) = src {
                    if self.backend.supports_peer_copy(src_device, dst) {
                        direct_sources.set(src);
                    }
                }
            }
        }

        Ok(RefreshInputs {
            validity,
            has_parent: entry.parent.is_some(),
            parent_valid_at_target,
            has_children: !children.is_empty(),
            children_rebuild_all,
            rebuild_base: if validity.is_empty() {
                entry.rebuild_base
            } else {
                None
            },
            direct_sources,
        })
    }

    /// Refresh protocol: make `id` valid at `location`.
    pub(crate) fn refresh(&mut self, id: ArrayId, location: Location) -> CoherenceResult<()> {
        self.resolve_disables(id)?;
        let inputs = self.refresh_inputs(id, location)?;
        let plan = plan_refresh(&inputs, location)?;
        if plan == RefreshPlan::AlreadyValid {
            self.touch(id, location);
            return Ok(());
        }

        tracing::debug!("Refreshing {} at {}: {:?}", id, location, plan);
        self.with_pins(id, |this| this.execute_refresh(id, location, plan))
    }

    fn execute_refresh(
        &mut self,
        id: ArrayId,
        location: Location,
        plan: RefreshPlan,
    ) -> CoherenceResult<()> {
        match plan {
            RefreshPlan::AlreadyValid => Ok(()),
            RefreshPlan::DeriveFromParent => {
                self.prepare_target(id, location)?;
                self.derive_from_parent(id, location)
            }
            RefreshPlan::CopyFrom { src } => self.copy_whole(id, src, location),
            RefreshPlan::Rebuild(kind) => {
                self.rebuild_at_host(id, kind)?;
                if location.is_host() {
                    Ok(())
                } else {
                    self.copy_whole(id, Location::Host, location)
                }
            }
            RefreshPlan::RefreshParentThenDerive => {
                let parent = self.entry(id)?.parent.ok_or_else(|| {
                    CoherenceError::violation(format!("{} has no parent to derive from", id))
                })?;
                if self.pins.in_progress(parent) {
                    return Err(CoherenceError::violation(format!(
                        "refresh of {} at {} needs its parent {}, which is being refreshed",
                        id, location, parent
                    )));
                }
                self.refresh(parent, location)?;
                self.prepare_target(id, location)?;
                self.derive_from_parent(id, location)
            }
        }
    }

    fn prepare_target(&mut self, id: ArrayId, location: Location) -> CoherenceResult<()> {
        match location {
            Location::Host => Ok(()),
            Location::Device(device) => self.ensure_buffer(id, device),
        }
    }

    fn device_buffer(&self, id: ArrayId, device: DeviceId) -> CoherenceResult<B::Buffer> {
        self.entry(id)?
            .buffers
            .get(device)
            .map(|slot| slot.buffer().clone())
            .ok_or_else(|| {
                CoherenceError::violation(format!("{} has no buffer at {}", id, device))
            })
    }

    /// Copy the whole array from `src` to `dst` and mark `dst` valid.
    fn copy_whole(&mut self, id: ArrayId, src: Location, dst: Location) -> CoherenceResult<()> {
        match (src, dst) {
            (Location::Host, Location::Host) => Ok(()),
            (Location::Host, Location::Device(device)) => {
                self.ensure_buffer(id, device)?;
                self.upload(id, device)
            }
            (Location::Device(device), Location::Host) => self.download(id, device),
            (Location::Device(src_device), Location::Device(dst_device)) => {
                if self.config.direct_device_copy
                    && self.backend.supports_peer_copy(src_device, dst_device)
                {
                    self.ensure_buffer(id, dst_device)?;
                    self.peer_copy(id, src_device, dst_device)
                } else {
                    tracing::debug!("Bouncing {} from {} to {} through host", id, src, dst);
                    self.download(id, src_device)?;
                    self.ensure_buffer(id, dst_device)?;
                    self.upload(id, dst_device)
                }
            }
        }
    }

    fn upload(&mut self, id: ArrayId, device: DeviceId) -> CoherenceResult<()> {
        let buffer = self.device_buffer(id, device)?;
        let entry = self.entry(id)?;
        let rect = CopyRect::linear(entry.host.len());
        self.backend
            .copy_host_to_device(&entry.host, &buffer, &rect)
            .map_err(backend_err("copy_host_to_device"))?;
        self.stats.transfer(TransferDirection::HostToDevice, rect.bytes());
        self.mark_valid(id, Location::Device(device))
    }

    /// Fetch the device copy into host storage without touching validity.
    fn fetch(&mut self, id: ArrayId, device: DeviceId) -> CoherenceResult<()> {
        let buffer = self.device_buffer(id, device)?;
        let entry = self.arrays.get_mut(id)?;
        let rect = CopyRect::linear(entry.host.len());
        self.backend
            .copy_device_to_host(&buffer, &mut entry.host, &rect)
            .map_err(backend_err("copy_device_to_host"))?;
        self.stats.transfer(TransferDirection::DeviceToHost, rect.bytes());
        Ok(())
    }

    fn download(&mut self, id: ArrayId, device: DeviceId) -> CoherenceResult<()> {
        self.fetch(id, device)?;
        self.mark_valid(id, Location::Host)
    }

    fn peer_copy(&mut self, id: ArrayId, src: DeviceId, dst: DeviceId) -> CoherenceResult<()> {
        let src_buffer = self.device_buffer(id, src)?;
        let dst_buffer = self.device_buffer(id, dst)?;
        let len = self.entry(id)?.desc.byte_len();
        self.backend
            .copy_device_to_device(&src_buffer, 0, &dst_buffer, 0, len)
            .map_err(backend_err("copy_device_to_device"))?;
        self.stats.transfer(
            TransferDirection::between(Location::Device(src), Location::Device(dst)),
            len,
        );
        self.mark_valid(id, Location::Device(dst))
    }

    /// Copy a rectangle between the host storage of two different arrays.
    pub(crate) fn copy_host_rect(
        &mut self,
        src: ArrayId,
        src_layout: &RectLayout,
        dst: ArrayId,
        dst_layout: &RectLayout,
        extent: [usize; 3],
    ) -> CoherenceResult<()> {
        let mut target = std::mem::take(&mut self.arrays.get_mut(dst)?.host);
        let result = match self.arrays.get(src) {
            Ok(source) => copy_rect(&source.host, src_layout, &mut target, dst_layout, extent)
                .map_err(|e| CoherenceError::violation(e.to_string())),
            Err(err) => Err(err),
        };
        self.arrays.get_mut(dst)?.host = target;
        result?;
        self.stats
            .transfer(TransferDirection::HostToHost, extent.iter().product());
        Ok(())
    }

    /// Copy a rectangle between two buffers on one device, row by row.
    pub(crate) fn copy_device_rect(
        &mut self,
        src: &B::Buffer,
        src_layout: RectLayout,
        dst: &B::Buffer,
        dst_layout: RectLayout,
        extent: [usize; 3],
    ) -> CoherenceResult<()> {
        for (src_offset, dst_offset) in row_pairs(src_layout, dst_layout, extent) {
            self.backend
                .copy_device_to_device(src, src_offset, dst, dst_offset, extent[0])
                .map_err(backend_err("copy_device_to_device"))?;
        }
        self.stats.transfer(
            TransferDirection::DeviceToDeviceSame,
            extent.iter().product(),
        );
        Ok(())
    }

    /// Extract the child's region from its parent, valid at `location`.
    fn derive_from_parent(&mut self, id: ArrayId, location: Location) -> CoherenceResult<()> {
        let entry = self.entry(id)?;
        let (parent, region) = match (entry.parent, entry.region.as_ref()) {
            (Some(parent), Some(region)) => (parent, region),
            _ => {
                return Err(CoherenceError::violation(format!(
                    "{} is not a child array",
                    id
                )))
            }
        };
        let parent_entry = self.entry(parent)?;
        let (src_layout, extent) =
            region.layout_in(&parent_entry.desc.shape, parent_entry.desc.elem_size);
        let (dst_layout, _) = dense_layout(&entry.desc.shape, entry.desc.elem_size);

        match location {
            Location::Host => {
                self.copy_host_rect(parent, &src_layout, id, &dst_layout, extent)?;
            }
            Location::Device(device) => match entry.buffers.get(device) {
                Some(BufferSlot::Sub(_)) => {
                    tracing::trace!("{} valid at {} through its sub-buffer", id, device);
                }
                Some(BufferSlot::Owned(buffer)) => {
                    let buffer = buffer.clone();
                    let parent_buffer = self.device_buffer(parent, device)?;
                    self.copy_device_rect(&parent_buffer, src_layout, &buffer, dst_layout, extent)?;
                }
                None => {
                    return Err(CoherenceError::violation(format!(
                        "{} has no buffer at {} to derive into",
                        id, device
                    )))
                }
            },
        }
        self.mark_valid(id, location)
    }

    /// Reassemble a stale parent in host storage from its children.
    fn rebuild_at_host(&mut self, id: ArrayId, kind: RebuildKind) -> CoherenceResult<()> {
        let entry = self.entry(id)?;
        let shape = entry.desc.shape.clone();
        let elem_size = entry.desc.elem_size;
        let mut sources = Vec::new();
        for (region, &child) in entry.registry.regions() {
            if kind == RebuildKind::Simple || self.effective_updated(child)? {
                sources.push((region.clone(), child));
            }
        }

        // Intermediate children that were never valid themselves take their
        // base from this array's base.
        let mut seeded = Vec::new();
        for (_, child) in &sources {
            if self.needs_seed(*child)? {
                seeded.push(*child);
            }
        }
        let base = match kind {
            RebuildKind::Complex { base } => Some(base),
            RebuildKind::Simple if !seeded.is_empty() => entry.rebuild_base,
            RebuildKind::Simple => None,
        };
        if let Some(Location::Device(device)) = base {
            self.fetch(id, device)?;
        }

        for (region, child) in &sources {
            let child_desc = &self.entry(*child)?.desc;
            let (child_layout, _) = dense_layout(&child_desc.shape, child_desc.elem_size);
            let (layout, extent) = region.layout_in(&shape, elem_size);
            if seeded.contains(child) {
                self.copy_host_rect(id, &layout, *child, &child_layout, extent)?;
                self.arrays.get_mut(*child)?.rebuild_base = Some(Location::Host);
            }
            self.refresh(*child, Location::Host)?;
            self.copy_host_rect(*child, &child_layout, id, &layout, extent)?;
        }
        let rebuilt: Vec<ArrayId> = sources.iter().map(|(_, child)| *child).collect();
        self.overlay_ghost_bands(id, &rebuilt)?;

        match kind {
            RebuildKind::Simple => self.stats.simple_rebuilds += 1,
            RebuildKind::Complex { .. } => self.stats.complex_rebuilds += 1,
        }
        self.arrays.get_mut(id)?.rebuild_base = None;
        tracing::debug!(
            "Rebuilt {} at host from {} children ({:?})",
            id,
            sources.len(),
            kind
        );
        self.mark_valid(id, Location::Host)
    }

    /// Whether a stale child can only be rebuilt over contents it never held:
    /// no valid copy, no base, and children that do not rebuild it alone.
    fn needs_seed(&self, id: ArrayId) -> CoherenceResult<bool> {
        let inputs = self.refresh_inputs(id, Location::Host)?;
        Ok(inputs.validity.is_empty()
            && inputs.rebuild_base.is_none()
            && inputs.has_children
            && !inputs.children_rebuild_all)
    }

    pub(crate) fn is_external(&self, id: ArrayId) -> CoherenceResult<bool> {
        Ok(self.entry(id)?.desc.storage == StorageClass::External)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetarray_compute::{EmulatedBackend, EmulatedDevice, PeerCopy};

    const GPU0: DeviceId = DeviceId::gpu(0);
    const GPU1: DeviceId = DeviceId::gpu(1);

    fn engine(peer: PeerCopy) -> Coherence<EmulatedBackend> {
        let backend = EmulatedBackend::new(vec![
            EmulatedDevice::new(GPU0, 1 << 20),
            EmulatedDevice::new(GPU1, 1 << 20),
        ])
        .unwrap()
        .with_peer_copy(peer);
        Coherence::new(backend)
    }

    #[test]
    fn test_create_from_is_host_valid() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create_from(&[4], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(engine.valid_locations(a).unwrap(), vec![Location::Host]);
        assert_eq!(engine.coherence_state(a).unwrap(), CoherenceState::RootValid);
        assert_eq!(
            engine.host_read_as::<f32>(a).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
        assert!(engine.create_from(&[5], &[1.0f32; 4]).is_err());
    }

    #[test]
    fn test_refresh_then_write_is_exclusive() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create_from(&[8], &[3u32; 8]).unwrap();

        engine
            .ensure_valid(a, GPU0.into(), AccessIntent::ReadOnly)
            .unwrap();
        engine
            .ensure_valid(a, GPU1.into(), AccessIntent::ReadOnly)
            .unwrap();
        assert_eq!(engine.valid_locations(a).unwrap().len(), 3);

        engine.commit_write(a, GPU1.into()).unwrap();
        assert_eq!(engine.valid_locations(a).unwrap(), vec![Location::Device(GPU1)]);
    }

    #[test]
    fn test_second_read_issues_no_transfer() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create_from(&[16], &[7u8; 16]).unwrap();

        engine
            .ensure_valid(a, GPU0.into(), AccessIntent::ReadOnly)
            .unwrap();
        let transfers = engine.stats().transfer_count();
        engine
            .ensure_valid(a, GPU0.into(), AccessIntent::ReadOnly)
            .unwrap();
        assert_eq!(engine.stats().transfer_count(), transfers);
    }

    #[test]
    fn test_peer_copy_vs_bounce() {
        let mut direct = engine(PeerCopy::SamePlatform);
        let a = direct.create_from(&[4], &[1u32, 2, 3, 4]).unwrap();
        direct.ensure_valid(a, GPU0.into(), AccessIntent::ReadWrite).unwrap();
        direct.commit_write(a, GPU0.into()).unwrap();
        direct.ensure_valid(a, GPU1.into(), AccessIntent::ReadOnly).unwrap();
        assert_eq!(direct.stats().transfers.d2d_bytes, 16);
        assert!(!direct.is_valid(a, Location::Host).unwrap());

        let mut bounced = engine(PeerCopy::Never);
        let b = bounced.create_from(&[4], &[1u32, 2, 3, 4]).unwrap();
        bounced.ensure_valid(b, GPU0.into(), AccessIntent::ReadWrite).unwrap();
        bounced.commit_write(b, GPU0.into()).unwrap();
        bounced.ensure_valid(b, GPU1.into(), AccessIntent::ReadOnly).unwrap();
        assert_eq!(bounced.stats().transfers.d2d_bytes, 0);
        assert_eq!(bounced.stats().transfers.d2h_bytes, 16);
        assert!(bounced.is_valid(b, Location::Host).unwrap());
        assert_eq!(bounced.host_read_as::<u32>(b).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_only_allocates_without_copy() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create(ArrayDesc::of::<f32>(&[32]).unwrap());
        engine
            .ensure_valid(a, GPU0.into(), AccessIntent::WriteOnly)
            .unwrap();
        assert!(engine.has_buffer(a, GPU0).unwrap());
        assert!(!engine.is_valid(a, GPU0.into()).unwrap());
        assert_eq!(engine.stats().transfer_count(), 0);
    }

    #[test]
    fn test_commit_without_buffer_is_violation() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create(ArrayDesc::of::<f32>(&[4]).unwrap());
        let err = engine.commit_write(a, GPU0.into()).unwrap_err();
        assert!(matches!(err, CoherenceError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unknown_device_is_configuration_error() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create(ArrayDesc::of::<f32>(&[4]).unwrap());
        let err = engine
            .ensure_valid(a, DeviceId::gpu(3).into(), AccessIntent::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, CoherenceError::Configuration(_)));
    }

    #[test]
    fn test_host_update() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create_from(&[3], &[1i32, 2, 3]).unwrap();
        engine.ensure_valid(a, GPU0.into(), AccessIntent::ReadOnly).unwrap();

        engine.host_update::<i32, _>(a, |xs| xs.iter_mut().for_each(|x| *x *= 10)).unwrap();
        assert_eq!(engine.valid_locations(a).unwrap(), vec![Location::Host]);
        assert_eq!(engine.host_read_as::<i32>(a).unwrap(), vec![10, 20, 30]);
        assert!(engine.host_read_as::<u8>(a).is_err());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut engine = engine(PeerCopy::SamePlatform);
        let a = engine.create(ArrayDesc::of::<f32>(&[4]).unwrap());
        engine.destroy(a).unwrap();
        assert!(matches!(
            engine.host_read(a),
            Err(CoherenceError::UnknownArray(_))
        ));
    }
}
