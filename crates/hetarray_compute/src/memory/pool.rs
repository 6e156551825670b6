//! Per-device memory accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::DeviceId;
use crate::error::{ComputeError, ComputeResult};

/// Capacity bookkeeping for one device.
///
/// Only owned allocations are charged; sub-buffers alias memory that is
/// already accounted for.
#[derive(Debug)]
pub struct DeviceMemory {
    device: DeviceId,
    capacity: u64,
    allocated_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    live_buffers: AtomicU64,
}

impl DeviceMemory {
    /// Create accounting for a device with `capacity` bytes.
    pub fn new(device: DeviceId, capacity: u64) -> Self {
        Self {
            device,
            capacity,
            allocated_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            live_buffers: AtomicU64::new(0),
        }
    }

    /// Reserve `size` bytes, failing with [`ComputeError::OutOfMemory`] when
    /// the device cannot hold them.
    pub fn try_reserve(&self, size: u64) -> ComputeResult<()> {
        let capacity = self.capacity;
        let reserved = self
            .allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|&next| next <= capacity)
            });

        match reserved {
            Ok(previous) => {
                self.peak_bytes.fetch_max(previous + size, Ordering::Relaxed);
                self.live_buffers.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(current) => Err(ComputeError::oom(
                self.device.to_string(),
                size,
                capacity.saturating_sub(current),
            )),
        }
    }

    /// Return `size` bytes to the device.
    pub fn release(&self, size: u64) {
        let _ = self
            .allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
        let _ = self
            .live_buffers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.allocated_bytes())
    }

    /// High-water mark of allocated bytes.
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Number of owned allocations alive.
    pub fn live_buffers(&self) -> u64 {
        self.live_buffers.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DeviceMemoryStats {
        DeviceMemoryStats {
            device_id: self.device,
            capacity: self.capacity,
            allocated_bytes: self.allocated_bytes(),
            peak_bytes: self.peak_bytes(),
            buffer_count: self.live_buffers() as usize,
        }
    }
}

/// Per-device memory statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMemoryStats {
    /// Device ID.
    pub device_id: DeviceId,
    /// Total capacity.
    pub capacity: u64,
    /// Allocated bytes.
    pub allocated_bytes: u64,
    /// Peak allocated bytes.
    pub peak_bytes: u64,
    /// Number of owned allocations.
    pub buffer_count: usize,
}
