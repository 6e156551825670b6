//! Compute backend abstractions.
//!
//! A backend owns the device command queues and exposes the handful of
//! blocking memory operations the coherency layer is built on. Every
//! operation returns only once the device has completed it.

#[cfg(feature = "emulated")]
pub mod emulated;

use crate::device::{DeviceId, DeviceInfo};
use crate::error::ComputeResult;
use crate::memory::{Buffer, CopyRect};

/// Core backend trait for device memory operations.
pub trait ComputeBackend: Send + Sync + 'static {
    /// Buffer handle type.
    type Buffer: Buffer;

    /// Get the backend name identifier.
    fn name(&self) -> &'static str;

    /// Enumerate all devices attached to this backend.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Look up one device.
    fn device_info(&self, device: DeviceId) -> Option<DeviceInfo> {
        self.devices().into_iter().find(|info| info.id == device)
    }

    /// Check whether a device is attached.
    fn has_device(&self, device: DeviceId) -> bool {
        self.device_info(device).is_some()
    }

    /// Allocate `size` bytes on `device`.
    ///
    /// Fails with [`ComputeError::OutOfMemory`](crate::ComputeError::OutOfMemory)
    /// when the device is full; callers may free memory and retry.
    fn allocate_buffer(&self, device: DeviceId, size: usize) -> ComputeResult<Self::Buffer>;

    /// Create a handle aliasing `size` bytes of `parent` starting at `offset`.
    fn allocate_sub_buffer(
        &self,
        parent: &Self::Buffer,
        offset: usize,
        size: usize,
    ) -> ComputeResult<Self::Buffer>;

    /// Release a buffer handle.
    fn release_buffer(&self, buffer: Self::Buffer) -> ComputeResult<()>;

    /// Copy a rectangle of host memory into a device buffer.
    fn copy_host_to_device(
        &self,
        src: &[u8],
        dst: &Self::Buffer,
        rect: &CopyRect,
    ) -> ComputeResult<()>;

    /// Copy a rectangle of a device buffer into host memory.
    fn copy_device_to_host(
        &self,
        src: &Self::Buffer,
        dst: &mut [u8],
        rect: &CopyRect,
    ) -> ComputeResult<()>;

    /// Copy bytes between two buffers, possibly on different devices.
    ///
    /// Only called when [`supports_peer_copy`](Self::supports_peer_copy)
    /// holds for the two devices.
    fn copy_device_to_device(
        &self,
        src: &Self::Buffer,
        src_offset: usize,
        dst: &Self::Buffer,
        dst_offset: usize,
        size: usize,
    ) -> ComputeResult<()>;

    /// Whether `copy_device_to_device` works from `src` to `dst`.
    /// Must hold whenever `src == dst`.
    fn supports_peer_copy(&self, src: DeviceId, dst: DeviceId) -> bool;

    /// Required alignment of sub-buffer origins on `device`.
    fn sub_buffer_alignment(&self, device: DeviceId) -> usize {
        self.device_info(device)
            .map(|info| info.sub_buffer_alignment.max(1))
            .unwrap_or(1)
    }
}
