//! # hetarray_compute
//!
//! Device layer for the hetarray coherency engine.
//!
//! This crate provides the pieces the engine needs from a compute runtime:
//!
//! - **Devices**: `(platform, kind, index)` identities and the [`Location`]
//!   set (every device plus the host)
//! - **Backend seam**: the [`ComputeBackend`] trait with blocking allocate,
//!   sub-buffer, release and rectangular copy operations
//! - **Memory**: per-device capacity accounting and transfer statistics
//! - **Emulated backend**: devices backed by host memory, with real capacity
//!   limits, peer-copy groups and fault injection
//!
//! ## Quick Start
//!
//! ```rust
//! use hetarray_compute::{ComputeBackend, CopyRect, DeviceId, EmulatedBackend};
//!
//! let backend = EmulatedBackend::gpus(2, 1 << 20).unwrap();
//! let buffer = backend.allocate_buffer(DeviceId::gpu(0), 16).unwrap();
//! backend
//!     .copy_host_to_device(&[1u8; 16], &buffer, &CopyRect::linear(16))
//!     .unwrap();
//! assert_eq!(backend.read_buffer(&buffer).unwrap(), vec![1u8; 16]);
//! ```
//!
//! ## Feature Flags
//!
//! - `emulated` (default): the in-process emulated backend

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod device;
pub mod error;
pub mod memory;

pub use backend::ComputeBackend;
pub use device::{
    DeviceId, DeviceInfo, DeviceKind, Location, HOST_SLOT, LOCATION_SLOTS, MAX_DEVICES_PER_KIND,
    MAX_PLATFORMS,
};
pub use error::{ComputeError, ComputeResult, OUT_OF_MEMORY_CODE};
pub use memory::{
    copy_rect, row_pairs, Buffer, CopyRect, DeviceMemory, DeviceMemoryStats, RectLayout,
    TransferDirection, TransferStats,
};

#[cfg(feature = "emulated")]
pub use backend::emulated::{
    EmulatedBackend, EmulatedBuffer, EmulatedDevice, FaultOp, PeerCopy,
    MISALIGNED_SUB_BUFFER_OFFSET,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::ComputeBackend;
    pub use crate::device::{DeviceId, DeviceKind, Location};
    pub use crate::error::{ComputeError, ComputeResult};
    pub use crate::memory::{Buffer, CopyRect, RectLayout};

    #[cfg(feature = "emulated")]
    pub use crate::backend::emulated::{EmulatedBackend, EmulatedDevice, PeerCopy};
}
