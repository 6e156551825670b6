//! Logical arrays and the arena that owns their coherence state.

use std::fmt;

use hetarray_compute::Location;
use serde::{Deserialize, Serialize};

use crate::buffers::DeviceBufferTable;
use crate::error::{CoherenceError, CoherenceResult};
use crate::region::{Region, MAX_RANK};
use crate::registry::ChildRegistry;
use crate::validity::ValidityMap;

/// Handle to a logical array.
///
/// Handles are generational: once an array is destroyed its handle stops
/// resolving, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId {
    index: u32,
    generation: u32,
}

impl ArrayId {
    /// Slot index inside the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array#{}v{}", self.index, self.generation)
    }
}

/// Where the host copy of an array comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StorageClass {
    /// Heap storage allocated and owned by the engine.
    #[default]
    Owned,
    /// Storage handed over by the caller, returned to it on destroy.
    External,
    /// Pinned host memory; a staging hint for backends that honour it.
    Fast,
}

/// Static description of a logical array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDesc {
    /// Size of one element in bytes.
    pub elem_size: usize,
    /// Extent per axis; empty for a scalar.
    pub shape: Vec<usize>,
    /// Host storage class.
    pub storage: StorageClass,
}

impl ArrayDesc {
    /// Describe an array of `shape` with `elem_size`-byte elements.
    pub fn new(elem_size: usize, shape: &[usize]) -> CoherenceResult<Self> {
        if elem_size == 0 {
            return Err(CoherenceError::violation("element size must be non-zero"));
        }
        if shape.len() > MAX_RANK {
            return Err(CoherenceError::violation(format!(
                "rank {} exceeds {}",
                shape.len(),
                MAX_RANK
            )));
        }
        if shape.iter().any(|&len| len == 0) {
            return Err(CoherenceError::violation(format!(
                "shape {:?} has an empty axis",
                shape
            )));
        }
        Ok(Self {
            elem_size,
            shape: shape.to_vec(),
            storage: StorageClass::Owned,
        })
    }

    /// Describe an array of `T` elements.
    pub fn of<T: bytemuck::Pod>(shape: &[usize]) -> CoherenceResult<Self> {
        Self::new(std::mem::size_of::<T>(), shape)
    }

    /// Set the storage class.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageClass) -> Self {
        self.storage = storage;
        self
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the array holds no element (never true for a valid desc).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.elem_size
    }
}

/// Coherence state of one array.
pub(crate) struct ArrayEntry<Buf> {
    pub desc: ArrayDesc,
    pub parent: Option<ArrayId>,
    pub region: Option<Region>,
    pub host: Vec<u8>,
    pub validity: ValidityMap,
    pub buffers: DeviceBufferTable<Buf>,
    /// Written since the last time it was invalidated through its parent.
    pub updated: bool,
    /// Location the contents were last valid at, kept while children
    /// hold newer data than the array itself.
    pub rebuild_base: Option<Location>,
    /// Written since the last ghost synchronization.
    pub ghost_dirty: bool,
    pub write_epoch: u64,
    pub registry: ChildRegistry,
}

impl<Buf> ArrayEntry<Buf> {
    pub fn root(desc: ArrayDesc, host: Vec<u8>) -> Self {
        Self {
            desc,
            parent: None,
            region: None,
            host,
            validity: ValidityMap::host_only(),
            buffers: DeviceBufferTable::default(),
            updated: false,
            rebuild_base: None,
            ghost_dirty: false,
            write_epoch: 0,
            registry: ChildRegistry::default(),
        }
    }

    pub fn child(desc: ArrayDesc, parent: ArrayId, region: Region) -> Self {
        let host = vec![0u8; desc.byte_len()];
        Self {
            parent: Some(parent),
            region: Some(region),
            validity: ValidityMap::empty(),
            ..Self::root(desc, host)
        }
    }

    pub fn has_children(&self) -> bool {
        !self.registry.is_empty()
    }
}

struct Slot<Buf> {
    generation: u32,
    entry: Option<ArrayEntry<Buf>>,
}

/// Generational arena of array entries.
pub(crate) struct Arena<Buf> {
    slots: Vec<Slot<Buf>>,
    free: Vec<u32>,
}

impl<Buf> Default for Arena<Buf> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<Buf> Arena<Buf> {
    pub fn insert(&mut self, entry: ArrayEntry<Buf>) -> ArrayId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                ArrayId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ArrayId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: ArrayId) -> CoherenceResult<&ArrayEntry<Buf>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(CoherenceError::UnknownArray(id))
    }

    pub fn get_mut(&mut self, id: ArrayId) -> CoherenceResult<&mut ArrayEntry<Buf>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(CoherenceError::UnknownArray(id))
    }

    pub fn contains(&self, id: ArrayId) -> bool {
        self.get(id).is_ok()
    }

    pub fn remove(&mut self, id: ArrayId) -> CoherenceResult<ArrayEntry<Buf>> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(CoherenceError::UnknownArray(id))?;
        let entry = slot.entry.take().ok_or(CoherenceError::UnknownArray(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ArrayEntry<()> {
        let desc = ArrayDesc::new(4, &[8]).unwrap();
        let host = vec![0u8; desc.byte_len()];
        ArrayEntry::root(desc, host)
    }

    #[test]
    fn test_desc_validation() {
        assert!(ArrayDesc::new(0, &[4]).is_err());
        assert!(ArrayDesc::new(4, &[1, 2, 3, 4]).is_err());
        assert!(ArrayDesc::new(4, &[4, 0]).is_err());

        let desc = ArrayDesc::of::<f32>(&[10, 10]).unwrap();
        assert_eq!(desc.byte_len(), 400);
        assert_eq!(desc.rank(), 2);

        let scalar = ArrayDesc::of::<f64>(&[]).unwrap();
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar.byte_len(), 8);
    }

    #[test]
    fn test_arena_generations() {
        let mut arena = Arena::default();
        let a = arena.insert(entry());
        assert!(arena.contains(a));

        arena.remove(a).unwrap();
        assert!(!arena.contains(a));
        assert!(matches!(arena.get(a), Err(CoherenceError::UnknownArray(_))));

        // The slot is reused under a new generation.
        let b = arena.insert(entry());
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(!arena.contains(a));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_new_root_is_valid_on_host() {
        let entry = entry();
        assert!(entry.validity.is_valid(Location::Host));
        assert_eq!(entry.validity.count(), 1);
        assert!(!entry.has_children());
    }
}
