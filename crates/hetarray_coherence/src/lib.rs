//! # hetarray_coherence
//!
//! Host/device memory coherency engine.
//!
//! Every logical array has a host copy and, lazily, one buffer per device it
//! is used on. The engine tracks which of those copies are current and moves
//! data on demand:
//!
//! - **Refresh protocol**: [`Coherence::ensure_valid`] makes a location
//!   valid, copying from a peer device, the host, a parent or a set of
//!   children, whichever applies
//! - **Write protocol**: [`Coherence::commit_write`] makes a location the
//!   single valid copy and invalidates the array's relatives
//! - **Hierarchy**: children are regions of a parent; overlapping siblings
//!   share halo bands reconciled by [`Coherence::sync_ghost`]
//! - **Allocation**: device buffers are allocated on first use, aliased into
//!   the parent's buffer when possible, and evicted least-recently-used
//!   first under memory pressure
//!
//! ## Quick Start
//!
//! ```rust
//! use hetarray_coherence::{AccessIntent, Coherence};
//! use hetarray_compute::{DeviceId, EmulatedBackend, Location};
//!
//! let backend = EmulatedBackend::gpus(2, 1 << 20).unwrap();
//! let mut engine = Coherence::new(backend);
//!
//! let x = engine.create_from(&[4], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
//! let gpu = DeviceId::gpu(0);
//!
//! engine.ensure_valid(x, gpu.into(), AccessIntent::ReadWrite).unwrap();
//! // ... a kernel writes the buffer ...
//! engine.commit_write(x, gpu.into()).unwrap();
//!
//! assert_eq!(engine.valid_locations(x).unwrap(), vec![Location::Device(gpu)]);
//! assert_eq!(engine.host_read_as::<f32>(x).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod allocator;
pub mod array;
pub mod buffers;
pub mod config;
pub mod engine;
pub mod error;
pub mod ghost;
mod hierarchy;
pub mod intent;
pub mod invocation;
mod lru;
pub mod region;
pub mod registry;
pub mod state;
pub mod stats;
pub mod validity;

pub use array::{ArrayDesc, ArrayId, StorageClass};
pub use buffers::BufferSlot;
pub use config::CoherenceConfig;
pub use engine::Coherence;
pub use error::{CoherenceError, CoherenceResult};
pub use ghost::{plan_ghost_copies, GhostCopy, GhostSide};
pub use intent::AccessIntent;
pub use invocation::{Binding, Invocation};
pub use region::{Overlap, Region, MAX_RANK};
pub use registry::{children_cover, OverlapLink};
pub use state::{classify, plan_refresh, CoherenceState, RebuildKind, RefreshInputs, RefreshPlan};
pub use stats::CoherenceStats;
pub use validity::ValidityMap;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::array::{ArrayDesc, ArrayId, StorageClass};
    pub use crate::config::CoherenceConfig;
    pub use crate::engine::Coherence;
    pub use crate::error::{CoherenceError, CoherenceResult};
    pub use crate::intent::AccessIntent;
    pub use crate::region::Region;
    pub use hetarray_compute::prelude::*;
}
