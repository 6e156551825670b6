//! Ghost (halo) synchronization between overlapping siblings.
//!
//! Siblings linked by an [`OverlapLink`] each hold a copy of the shared
//! band. A write to one side leaves the other side's copy stale until
//! [`Coherence::sync_ghost`] reconciles them. Which cells flow in which
//! direction is decided by [`plan_ghost_copies`], without touching memory.

use hetarray_compute::{
    copy_rect, ComputeBackend, CopyRect, Location, RectLayout, TransferDirection,
};

use crate::array::ArrayId;
use crate::engine::{backend_err, Coherence};
use crate::error::{CoherenceError, CoherenceResult};
use crate::region::Region;
use crate::registry::OverlapLink;
use crate::validity::ValidityMap;

/// One halo copy between linked siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostCopy {
    /// Sibling holding the newer cells.
    pub from: ArrayId,
    /// Sibling receiving them.
    pub to: ArrayId,
    /// Cells to copy, in parent coordinates.
    pub band: Region,
}

/// Write state of one side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GhostSide {
    /// Written since the last synchronization.
    pub dirty: bool,
    /// Engine epoch of the last write.
    pub write_epoch: u64,
}

/// Copies that reconcile one link.
///
/// A single written side wins the whole band. When both sides were written,
/// each owns the half of the band next to its interior; a one-cell band has
/// no halves, so the later write wins it.
pub fn plan_ghost_copies(link: &OverlapLink, lower: GhostSide, upper: GhostSide) -> Vec<GhostCopy> {
    let whole = |from, to| GhostCopy {
        from,
        to,
        band: link.band.clone(),
    };

    match (lower.dirty, upper.dirty) {
        (false, false) => Vec::new(),
        (true, false) => vec![whole(link.lower, link.upper)],
        (false, true) => vec![whole(link.upper, link.lower)],
        (true, true) if link.width() == 1 => {
            if upper.write_epoch > lower.write_epoch {
                vec![whole(link.upper, link.lower)]
            } else {
                vec![whole(link.lower, link.upper)]
            }
        }
        (true, true) => {
            let axis = link.axis;
            let start = link.band.origin()[axis];
            let end = link.band.end()[axis];
            let halo = link.halo();
            vec![
                GhostCopy {
                    from: link.lower,
                    to: link.upper,
                    band: link.band.with_axis(axis, start, start + halo - 1),
                },
                GhostCopy {
                    from: link.upper,
                    to: link.lower,
                    band: link.band.with_axis(axis, end + 1 - halo, end),
                },
            ]
        }
    }
}

impl<B: ComputeBackend> Coherence<B> {
    /// Reconcile the halo bands of every linked pair of children of
    /// `parent`. Returns the number of band copies issued.
    ///
    /// A same-device pair is synchronized with device-to-device rectangle
    /// copies; anything else is staged through a dense host buffer.
    pub fn sync_ghost(&mut self, parent: ArrayId) -> CoherenceResult<usize> {
        self.resolve_disables(parent)?;
        let links = self.entry(parent)?.registry.links().to_vec();
        if links.is_empty() {
            return Ok(0);
        }

        let mut copies = 0;
        for link in &links {
            let lower = self.ghost_side(link.lower)?;
            let upper = self.ghost_side(link.upper)?;
            for copy in plan_ghost_copies(link, lower, upper) {
                if self.effective_validity(copy.from)?.is_empty() {
                    continue;
                }
                self.copy_band(&copy)?;
                copies += 1;
            }
        }

        for child in self.entry(parent)?.registry.children() {
            self.arrays.get_mut(child)?.ghost_dirty = false;
        }
        self.stats.ghost_copies += copies as u64;
        if copies > 0 {
            tracing::debug!("Synchronized {} ghost bands under {}", copies, parent);
        }
        Ok(copies)
    }

    /// Overlay the halo bands of a parent being rebuilt at Host.
    ///
    /// Children land in the parent in region order, so a shared band holds
    /// whichever sibling was copied last. This rewrites every band with the
    /// cells [`plan_ghost_copies`] assigns to each side, giving the same
    /// bytes as a [`Coherence::sync_ghost`] ahead of the rebuild. Only
    /// children in `rebuilt` have current host storage.
    pub(crate) fn overlay_ghost_bands(
        &mut self,
        parent: ArrayId,
        rebuilt: &[ArrayId],
    ) -> CoherenceResult<usize> {
        let entry = self.entry(parent)?;
        let links = entry.registry.links().to_vec();
        let shape = entry.desc.shape.clone();
        let elem_size = entry.desc.elem_size;

        let mut overlaid = 0;
        for link in &links {
            let lower = self.ghost_side(link.lower)?;
            let upper = self.ghost_side(link.upper)?;
            for copy in plan_ghost_copies(link, lower, upper) {
                if !rebuilt.contains(&copy.from) {
                    continue;
                }
                let (src_layout, extent) = self.band_in(copy.from, &copy.band)?;
                let (dst_layout, _) = copy.band.layout_in(&shape, elem_size);
                self.copy_host_rect(copy.from, &src_layout, parent, &dst_layout, extent)?;
                overlaid += 1;
            }
        }
        Ok(overlaid)
    }

    fn ghost_side(&self, id: ArrayId) -> CoherenceResult<GhostSide> {
        let entry = self.entry(id)?;
        Ok(GhostSide {
            dirty: entry.ghost_dirty,
            write_epoch: entry.write_epoch,
        })
    }

    fn band_in(&self, id: ArrayId, band: &Region) -> CoherenceResult<(RectLayout, [usize; 3])> {
        let entry = self.entry(id)?;
        let local = entry
            .region
            .as_ref()
            .and_then(|region| band.relative_to(region))
            .ok_or_else(|| {
                CoherenceError::violation(format!("band {} lies outside {}", band, id))
            })?;
        Ok(local.layout_in(&entry.desc.shape, entry.desc.elem_size))
    }

    fn copy_band(&mut self, copy: &GhostCopy) -> CoherenceResult<()> {
        let GhostCopy { from, to, band } = copy;
        let (from, to) = (*from, *to);

        if self.effective_validity(to)?.is_empty() {
            self.refresh(to, Location::Host)?;
        }
        let from_valid = self.effective_validity(from)?;
        let to_valid = self.effective_validity(to)?;
        let dst = band_destination(from_valid, to_valid);
        let src = if from_valid.is_valid(dst) {
            dst
        } else if from_valid.is_valid(Location::Host) {
            Location::Host
        } else {
            from_valid.first_device().unwrap_or(Location::Host)
        };

        let (src_layout, extent) = self.band_in(from, band)?;
        let (dst_layout, _) = self.band_in(to, band)?;
        tracing::trace!("Ghost band {} from {} at {} to {} at {}", band, from, src, to, dst);

        match (src, dst) {
            (Location::Device(src_device), Location::Device(dst_device))
                if src_device == dst_device =>
            {
                let src_buffer = self.band_buffer(from, src)?;
                let dst_buffer = self.band_buffer(to, dst)?;
                self.copy_device_rect(&src_buffer, src_layout, &dst_buffer, dst_layout, extent)?;
            }
            (Location::Host, Location::Host) => {
                self.copy_host_rect(from, &src_layout, to, &dst_layout, extent)?;
            }
            _ => {
                let staging = RectLayout::dense(extent);
                let mut bytes = vec![0u8; extent.iter().product()];
                self.read_band(from, src, &src_layout, &mut bytes, &staging, extent)?;
                self.write_band(to, dst, &dst_layout, &bytes, &staging, extent)?;
            }
        }

        let entry = self.arrays.get_mut(to)?;
        entry.validity = ValidityMap::only(dst);
        entry.updated = true;
        if entry.has_children() {
            entry.registry.children_disabled = true;
        }
        self.mark_ancestors_stale(to)?;
        self.touch(to, dst);
        Ok(())
    }

    fn band_buffer(&self, id: ArrayId, location: Location) -> CoherenceResult<B::Buffer> {
        let Location::Device(device) = location else {
            return Err(CoherenceError::violation(format!(
                "{} has no device buffer at {}",
                id, location
            )));
        };
        self.entry(id)?
            .buffers
            .get(device)
            .map(|slot| slot.buffer().clone())
            .ok_or_else(|| CoherenceError::violation(format!("{} has no buffer at {}", id, device)))
    }

    fn read_band(
        &mut self,
        id: ArrayId,
        src: Location,
        layout: &RectLayout,
        staging: &mut [u8],
        staging_layout: &RectLayout,
        extent: [usize; 3],
    ) -> CoherenceResult<()> {
        match src {
            Location::Host => copy_rect(&self.entry(id)?.host, layout, staging, staging_layout, extent)
                .map_err(|e| CoherenceError::violation(e.to_string())),
            Location::Device(_) => {
                let buffer = self.band_buffer(id, src)?;
                let rect = CopyRect {
                    buffer: *layout,
                    host: *staging_layout,
                    extent,
                };
                self.backend
                    .copy_device_to_host(&buffer, staging, &rect)
                    .map_err(backend_err("copy_device_to_host"))?;
                self.stats.transfer(TransferDirection::DeviceToHost, rect.bytes());
                Ok(())
            }
        }
    }

    fn write_band(
        &mut self,
        id: ArrayId,
        dst: Location,
        layout: &RectLayout,
        staging: &[u8],
        staging_layout: &RectLayout,
        extent: [usize; 3],
    ) -> CoherenceResult<()> {
        match dst {
            Location::Host => {
                let host = &mut self.arrays.get_mut(id)?.host;
                copy_rect(staging, staging_layout, host, layout, extent)
                    .map_err(|e| CoherenceError::violation(e.to_string()))
            }
            Location::Device(_) => {
                let buffer = self.band_buffer(id, dst)?;
                let rect = CopyRect {
                    buffer: *layout,
                    host: *staging_layout,
                    extent,
                };
                self.backend
                    .copy_host_to_device(staging, &buffer, &rect)
                    .map_err(backend_err("copy_host_to_device"))?;
                self.stats.transfer(TransferDirection::HostToDevice, rect.bytes());
                Ok(())
            }
        }
    }
}

/// Location the receiving sibling takes the band at: a device both sides
/// are valid on, else the host, else wherever the receiver is valid.
fn band_destination(from_valid: ValidityMap, to_valid: ValidityMap) -> Location {
    let shared = to_valid
        .locations()
        .find(|loc| !loc.is_host() && from_valid.is_valid(*loc));
    if let Some(device) = shared {
        return device;
    }
    if to_valid.is_valid(Location::Host) {
        return Location::Host;
    }
    to_valid.first_device().unwrap_or(Location::Host)
}
