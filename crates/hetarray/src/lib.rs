//! # hetarray
//!
//! Arrays that live coherently in host memory and on any number of compute
//! devices.
//!
//! hetarray provides:
//!
//! - **Devices**: device identities, the backend seam and an emulated
//!   multi-device backend ([`compute`])
//! - **Coherence**: validity tracking, refresh and write protocols, child
//!   regions with ghost bands, buffer allocation and LRU eviction
//!   ([`coherence`])
//!
//! ## Quick Start
//!
//! ```rust
//! use hetarray::prelude::*;
//!
//! let backend = EmulatedBackend::gpus(2, 1 << 20).unwrap();
//! let mut engine = Coherence::new(backend);
//!
//! // A 4x4 matrix split into two row bands.
//! let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
//! let matrix = engine.create_from(&[4, 4], &data).unwrap();
//! let top = engine.register_child(matrix, Region::span(&[0, 0], &[2, 4]).unwrap()).unwrap();
//! let bottom = engine.register_child(matrix, Region::span(&[2, 0], &[2, 4]).unwrap()).unwrap();
//!
//! // Each band goes to its own device, is written there...
//! for (band, gpu) in [(top, DeviceId::gpu(0)), (bottom, DeviceId::gpu(1))] {
//!     engine.ensure_valid(band, gpu.into(), AccessIntent::ReadWrite).unwrap();
//!     engine.commit_write(band, gpu.into()).unwrap();
//! }
//!
//! // ...and the matrix is reassembled on the host on demand.
//! assert_eq!(engine.host_read_as::<f32>(matrix).unwrap(), data);
//! ```
//!
//! ## Feature Flags
//!
//! - `emulated` (default): the in-process emulated backend

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub use hetarray_coherence as coherence;
pub use hetarray_compute as compute;

/// Prelude module for convenient imports.
///
/// ```rust
/// use hetarray::prelude::*;
/// ```
pub mod prelude {
    // Devices and backends
    pub use hetarray_compute::{
        Buffer, ComputeBackend, ComputeError, DeviceId, DeviceKind, Location, TransferStats,
    };
    #[cfg(feature = "emulated")]
    pub use hetarray_compute::{EmulatedBackend, EmulatedDevice, FaultOp, PeerCopy};

    // Coherence
    pub use hetarray_coherence::{
        AccessIntent, ArrayDesc, ArrayId, Coherence, CoherenceConfig, CoherenceError,
        CoherenceResult, CoherenceState, CoherenceStats, Invocation, OverlapLink, Region,
        StorageClass,
    };
}
