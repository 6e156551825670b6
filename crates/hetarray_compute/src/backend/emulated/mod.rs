//! Emulated compute backend.
//!
//! Every device is backed by host memory, with a fixed capacity so that
//! allocation pressure behaves like a real accelerator:
//! - Owned buffers are charged against the device capacity
//! - Sub-buffers alias their parent allocation and cost nothing
//! - Peer copies follow a configurable [`PeerCopy`] policy
//! - One-shot fault injection per operation for failure testing

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::ComputeBackend;
use crate::device::{DeviceId, DeviceInfo};
use crate::error::{ComputeError, ComputeResult};
use crate::memory::{
    copy_rect, Buffer, CopyRect, DeviceMemory, DeviceMemoryStats, TransferDirection,
    TransferStats,
};

/// Native code reported for a sub-buffer origin that violates the device
/// alignment (mirrors `CL_MISALIGNED_SUB_BUFFER_OFFSET`).
pub const MISALIGNED_SUB_BUFFER_OFFSET: i32 = -13;

const BACKEND_NAME: &str = "emulated";

/// Emulated device description.
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    info: DeviceInfo,
}

impl EmulatedDevice {
    /// Create a device with `capacity` bytes of memory.
    pub fn new(id: DeviceId, capacity: u64) -> Self {
        Self {
            info: DeviceInfo {
                id,
                name: format!("Emulated {} ({})", id.kind(), id),
                total_memory: capacity,
                sub_buffer_alignment: 1,
            },
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    /// Set the required sub-buffer origin alignment (bytes).
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.info.sub_buffer_alignment = alignment.max(1);
        self
    }

    /// Device description.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

/// Which device pairs accept direct copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerCopy {
    /// Only copies within one device.
    Never,
    /// Devices of the same platform can copy to each other.
    #[default]
    SamePlatform,
    /// Any pair of devices.
    Always,
}

/// Operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    /// `allocate_buffer`.
    Allocate,
    /// `allocate_sub_buffer`.
    AllocateSubBuffer,
    /// `release_buffer`.
    Release,
    /// `copy_host_to_device`.
    HostToDevice,
    /// `copy_device_to_host`.
    DeviceToHost,
    /// `copy_device_to_device`.
    DeviceToDevice,
}

impl FaultOp {
    fn operation(&self) -> &'static str {
        match self {
            FaultOp::Allocate => "allocate",
            FaultOp::AllocateSubBuffer => "allocate_sub_buffer",
            FaultOp::Release => "release",
            FaultOp::HostToDevice => "copy_host_to_device",
            FaultOp::DeviceToHost => "copy_device_to_host",
            FaultOp::DeviceToDevice => "copy_device_to_device",
        }
    }
}

struct Allocation {
    id: u64,
    device: DeviceId,
    data: Mutex<Vec<u8>>,
    released: AtomicBool,
}

/// Emulated buffer handle.
#[derive(Clone)]
pub struct EmulatedBuffer {
    allocation: Arc<Allocation>,
    released: Arc<AtomicBool>,
    offset: usize,
    size: usize,
    is_sub: bool,
}

impl EmulatedBuffer {
    /// Identifier of the underlying allocation (shared by sub-buffers).
    pub fn allocation_id(&self) -> u64 {
        self.allocation.id
    }

    /// Whether two handles address the same allocation.
    pub fn shares_allocation(&self, other: &EmulatedBuffer) -> bool {
        Arc::ptr_eq(&self.allocation, &other.allocation)
    }

    fn check_live(&self, operation: &str) -> ComputeResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(ComputeError::BufferError(format!(
                "{} on released buffer #{}",
                operation, self.allocation.id
            )));
        }
        if self.allocation.released.load(Ordering::Acquire) {
            return Err(ComputeError::BufferError(format!(
                "{} on sub-buffer of released allocation #{}",
                operation, self.allocation.id
            )));
        }
        Ok(())
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

impl fmt::Debug for EmulatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedBuffer")
            .field("allocation", &self.allocation.id)
            .field("device", &self.allocation.device)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("is_sub", &self.is_sub)
            .finish()
    }
}

impl Buffer for EmulatedBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn device_id(&self) -> DeviceId {
        self.allocation.device
    }

    fn is_sub_buffer(&self) -> bool {
        self.is_sub
    }

    fn parent_offset(&self) -> usize {
        if self.is_sub {
            self.offset
        } else {
            0
        }
    }
}

/// Emulated multi-device backend.
pub struct EmulatedBackend {
    devices: Vec<EmulatedDevice>,
    memory: HashMap<DeviceId, DeviceMemory>,
    peer_copy: PeerCopy,
    faults: Mutex<HashMap<FaultOp, i32>>,
    stats: Mutex<TransferStats>,
    next_id: AtomicU64,
}

impl EmulatedBackend {
    /// Create a backend with the given devices.
    pub fn new(devices: Vec<EmulatedDevice>) -> ComputeResult<Self> {
        let mut memory = HashMap::with_capacity(devices.len());
        for device in &devices {
            let id = device.info.id;
            if memory
                .insert(id, DeviceMemory::new(id, device.info.total_memory))
                .is_some()
            {
                return Err(ComputeError::InvalidConfig(format!(
                    "device {} registered twice",
                    id
                )));
            }
        }

        Ok(Self {
            devices,
            memory,
            peer_copy: PeerCopy::default(),
            faults: Mutex::new(HashMap::new()),
            stats: Mutex::new(TransferStats::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// `count` GPUs on platform 0, each with `capacity` bytes.
    pub fn gpus(count: u8, capacity: u64) -> ComputeResult<Self> {
        let devices = (0..count)
            .map(|index| {
                DeviceId::new(0, crate::device::DeviceKind::Gpu, index)
                    .map(|id| EmulatedDevice::new(id, capacity))
            })
            .collect::<ComputeResult<Vec<_>>>()?;
        Self::new(devices)
    }

    /// Set the peer-copy policy.
    pub fn with_peer_copy(mut self, policy: PeerCopy) -> Self {
        self.peer_copy = policy;
        self
    }

    /// Make the next call of `op` fail with native `code`.
    pub fn inject_fault(&self, op: FaultOp, code: i32) {
        self.faults.lock().insert(op, code);
    }

    /// Transfer statistics since creation or the last reset.
    pub fn transfer_stats(&self) -> TransferStats {
        self.stats.lock().clone()
    }

    /// Reset transfer statistics.
    pub fn reset_transfer_stats(&self) {
        *self.stats.lock() = TransferStats::default();
    }

    /// Memory statistics of one device.
    pub fn memory_stats(&self, device: DeviceId) -> Option<DeviceMemoryStats> {
        self.memory.get(&device).map(DeviceMemory::stats)
    }

    /// Read the full contents of a buffer (emulates a kernel reading it).
    pub fn read_buffer(&self, buffer: &EmulatedBuffer) -> ComputeResult<Vec<u8>> {
        buffer.check_live("read_buffer")?;
        let data = buffer.allocation.data.lock();
        Ok(data[buffer.range()].to_vec())
    }

    /// Overwrite the full contents of a buffer (emulates a kernel writing it).
    pub fn write_buffer(&self, buffer: &EmulatedBuffer, bytes: &[u8]) -> ComputeResult<()> {
        buffer.check_live("write_buffer")?;
        if bytes.len() != buffer.size {
            return Err(ComputeError::BufferError(format!(
                "write of {} bytes into buffer of {} bytes",
                bytes.len(),
                buffer.size
            )));
        }
        let mut data = buffer.allocation.data.lock();
        data[buffer.range()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a buffer as typed elements.
    pub fn read_elements<T: bytemuck::Pod>(&self, buffer: &EmulatedBuffer) -> ComputeResult<Vec<T>> {
        let bytes = self.read_buffer(buffer)?;
        if bytes.len() % std::mem::size_of::<T>() != 0 {
            return Err(ComputeError::BufferError(format!(
                "buffer of {} bytes is not a whole number of {}-byte elements",
                bytes.len(),
                std::mem::size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Apply `f` to every element of a buffer, in place.
    pub fn map_elements<T, F>(&self, buffer: &EmulatedBuffer, mut f: F) -> ComputeResult<()>
    where
        T: bytemuck::Pod,
        F: FnMut(&mut T),
    {
        let mut elements = self.read_elements::<T>(buffer)?;
        elements.iter_mut().for_each(&mut f);
        self.write_buffer(buffer, bytemuck::cast_slice(&elements))
    }

    fn take_fault(&self, op: FaultOp) -> ComputeResult<()> {
        match self.faults.lock().remove(&op) {
            Some(code) => {
                tracing::debug!("Injected fault in {}: code {}", op.operation(), code);
                Err(ComputeError::backend(BACKEND_NAME, op.operation(), code))
            }
            None => Ok(()),
        }
    }

    fn memory_of(&self, device: DeviceId) -> ComputeResult<&DeviceMemory> {
        self.memory
            .get(&device)
            .ok_or_else(|| ComputeError::DeviceNotFound(device.to_string()))
    }

    fn record(&self, direction: TransferDirection, bytes: usize) {
        self.stats.lock().record(direction, bytes as u64);
    }
}

impl ComputeBackend for EmulatedBackend {
    type Buffer = EmulatedBuffer;

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|d| d.info.clone()).collect()
    }

    fn has_device(&self, device: DeviceId) -> bool {
        self.memory.contains_key(&device)
    }

    fn allocate_buffer(&self, device: DeviceId, size: usize) -> ComputeResult<Self::Buffer> {
        self.take_fault(FaultOp::Allocate)?;
        self.memory_of(device)?.try_reserve(size as u64)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Allocated buffer #{} ({} bytes) on {}", id, size, device);

        Ok(EmulatedBuffer {
            allocation: Arc::new(Allocation {
                id,
                device,
                data: Mutex::new(vec![0u8; size]),
                released: AtomicBool::new(false),
            }),
            released: Arc::new(AtomicBool::new(false)),
            offset: 0,
            size,
            is_sub: false,
        })
    }

    fn allocate_sub_buffer(
        &self,
        parent: &Self::Buffer,
        offset: usize,
        size: usize,
    ) -> ComputeResult<Self::Buffer> {
        self.take_fault(FaultOp::AllocateSubBuffer)?;
        parent.check_live("allocate_sub_buffer")?;

        if parent.is_sub {
            return Err(ComputeError::BufferError(
                "cannot create a sub-buffer of a sub-buffer".to_string(),
            ));
        }
        if offset + size > parent.size {
            return Err(ComputeError::BufferError(format!(
                "sub-buffer [{}, {}) exceeds parent of {} bytes",
                offset,
                offset + size,
                parent.size
            )));
        }
        let alignment = self.sub_buffer_alignment(parent.device_id());
        if offset % alignment != 0 {
            return Err(ComputeError::backend(
                BACKEND_NAME,
                "allocate_sub_buffer",
                MISALIGNED_SUB_BUFFER_OFFSET,
            ));
        }

        Ok(EmulatedBuffer {
            allocation: Arc::clone(&parent.allocation),
            released: Arc::new(AtomicBool::new(false)),
            offset: parent.offset + offset,
            size,
            is_sub: true,
        })
    }

    fn release_buffer(&self, buffer: Self::Buffer) -> ComputeResult<()> {
        self.take_fault(FaultOp::Release)?;
        if buffer.released.swap(true, Ordering::AcqRel) {
            return Err(ComputeError::BufferError(format!(
                "buffer #{} released twice",
                buffer.allocation.id
            )));
        }
        if !buffer.is_sub {
            buffer.allocation.released.store(true, Ordering::Release);
            self.memory_of(buffer.device_id())?.release(buffer.size as u64);
            tracing::trace!(
                "Released buffer #{} ({} bytes) on {}",
                buffer.allocation.id,
                buffer.size,
                buffer.device_id()
            );
        }
        Ok(())
    }

    fn copy_host_to_device(
        &self,
        src: &[u8],
        dst: &Self::Buffer,
        rect: &CopyRect,
    ) -> ComputeResult<()> {
        self.take_fault(FaultOp::HostToDevice)?;
        dst.check_live("copy_host_to_device")?;
        rect.validate(dst.size, src.len())?;

        {
            let mut data = dst.allocation.data.lock();
            copy_rect(src, &rect.host, &mut data[dst.range()], &rect.buffer, rect.extent)?;
        }
        self.record(TransferDirection::HostToDevice, rect.bytes());
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        src: &Self::Buffer,
        dst: &mut [u8],
        rect: &CopyRect,
    ) -> ComputeResult<()> {
        self.take_fault(FaultOp::DeviceToHost)?;
        src.check_live("copy_device_to_host")?;
        rect.validate(src.size, dst.len())?;

        {
            let data = src.allocation.data.lock();
            copy_rect(&data[src.range()], &rect.buffer, dst, &rect.host, rect.extent)?;
        }
        self.record(TransferDirection::DeviceToHost, rect.bytes());
        Ok(())
    }

    fn copy_device_to_device(
        &self,
        src: &Self::Buffer,
        src_offset: usize,
        dst: &Self::Buffer,
        dst_offset: usize,
        size: usize,
    ) -> ComputeResult<()> {
        self.take_fault(FaultOp::DeviceToDevice)?;
        src.check_live("copy_device_to_device")?;
        dst.check_live("copy_device_to_device")?;

        if !self.supports_peer_copy(src.device_id(), dst.device_id()) {
            return Err(ComputeError::TransferError(format!(
                "no direct path from {} to {}",
                src.device_id(),
                dst.device_id()
            )));
        }
        if src_offset + size > src.size {
            return Err(ComputeError::TransferError("Source overflow".to_string()));
        }
        if dst_offset + size > dst.size {
            return Err(ComputeError::TransferError("Destination overflow".to_string()));
        }

        let from = src.offset + src_offset;
        let to = dst.offset + dst_offset;
        if src.shares_allocation(dst) {
            let mut data = dst.allocation.data.lock();
            data.copy_within(from..from + size, to);
        } else {
            let staged = src.allocation.data.lock()[from..from + size].to_vec();
            dst.allocation.data.lock()[to..to + size].copy_from_slice(&staged);
        }

        let direction = if src.device_id() == dst.device_id() {
            TransferDirection::DeviceToDeviceSame
        } else {
            TransferDirection::DeviceToDevicePeer
        };
        self.record(direction, size);
        Ok(())
    }

    fn supports_peer_copy(&self, src: DeviceId, dst: DeviceId) -> bool {
        if !self.has_device(src) || !self.has_device(dst) {
            return false;
        }
        if src == dst {
            return true;
        }
        match self.peer_copy {
            PeerCopy::Never => false,
            PeerCopy::SamePlatform => src.platform() == dst.platform(),
            PeerCopy::Always => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RectLayout;

    fn backend() -> EmulatedBackend {
        EmulatedBackend::new(vec![
            EmulatedDevice::new(DeviceId::gpu(0), 1024),
            EmulatedDevice::new(DeviceId::gpu(1), 1024).with_alignment(64),
            EmulatedDevice::new(DeviceId::gpu(0).on_platform(1), 1024),
        ])
        .unwrap()
    }

    #[test]
    fn test_emulated_backend_devices() {
        let backend = backend();
        assert_eq!(backend.name(), "emulated");
        assert_eq!(backend.devices().len(), 3);
        assert!(backend.has_device(DeviceId::gpu(1)));
        assert!(!backend.has_device(DeviceId::gpu(3)));
        assert_eq!(backend.sub_buffer_alignment(DeviceId::gpu(1)), 64);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let result = EmulatedBackend::new(vec![
            EmulatedDevice::new(DeviceId::gpu(0), 16),
            EmulatedDevice::new(DeviceId::gpu(0), 16),
        ]);
        assert!(matches!(result, Err(ComputeError::InvalidConfig(_))));
    }

    #[test]
    fn test_allocation_respects_capacity() {
        let backend = backend();
        let a = backend.allocate_buffer(DeviceId::gpu(0), 1000).unwrap();
        let err = backend.allocate_buffer(DeviceId::gpu(0), 100).unwrap_err();
        assert!(err.is_out_of_memory());

        backend.release_buffer(a).unwrap();
        backend.allocate_buffer(DeviceId::gpu(0), 100).unwrap();
        assert_eq!(backend.memory_stats(DeviceId::gpu(0)).unwrap().allocated_bytes, 100);
    }

    #[test]
    fn test_allocate_on_missing_device() {
        let backend = backend();
        let err = backend.allocate_buffer(DeviceId::gpu(4), 8).unwrap_err();
        assert!(matches!(err, ComputeError::DeviceNotFound(_)));
    }

    #[test]
    fn test_sub_buffer_aliases_parent() {
        let backend = backend();
        let parent = backend.allocate_buffer(DeviceId::gpu(0), 16).unwrap();
        let sub = backend.allocate_sub_buffer(&parent, 8, 8).unwrap();
        assert!(sub.is_sub_buffer());
        assert_eq!(sub.parent_offset(), 8);
        assert!(sub.shares_allocation(&parent));

        backend.write_buffer(&sub, &[7u8; 8]).unwrap();
        let bytes = backend.read_buffer(&parent).unwrap();
        assert_eq!(&bytes[..8], &[0u8; 8]);
        assert_eq!(&bytes[8..], &[7u8; 8]);

        // Sub-buffers are free.
        assert_eq!(backend.memory_stats(DeviceId::gpu(0)).unwrap().allocated_bytes, 16);
    }

    #[test]
    fn test_sub_buffer_alignment_enforced() {
        let backend = backend();
        let parent = backend.allocate_buffer(DeviceId::gpu(1), 256).unwrap();
        let err = backend.allocate_sub_buffer(&parent, 32, 32).unwrap_err();
        assert_eq!(err.code(), Some(MISALIGNED_SUB_BUFFER_OFFSET));
        assert!(backend.allocate_sub_buffer(&parent, 64, 32).is_ok());
    }

    #[test]
    fn test_released_buffer_rejected() {
        let backend = backend();
        let parent = backend.allocate_buffer(DeviceId::gpu(0), 16).unwrap();
        let sub = backend.allocate_sub_buffer(&parent, 0, 8).unwrap();
        backend.release_buffer(parent.clone()).unwrap();

        assert!(backend.read_buffer(&sub).is_err());
        assert!(backend.release_buffer(parent).is_err());
    }

    #[test]
    fn test_rect_round_trip() {
        let backend = backend();
        let buffer = backend.allocate_buffer(DeviceId::gpu(0), 4).unwrap();

        // Upload the centre 2x2 block of a 4x4 host matrix.
        let host: Vec<u8> = (0..16).collect();
        let rect = CopyRect {
            buffer: RectLayout::dense([2, 2, 1]),
            host: RectLayout::dense([4, 4, 1]).with_origin([1, 1, 0]),
            extent: [2, 2, 1],
        };
        backend.copy_host_to_device(&host, &buffer, &rect).unwrap();
        assert_eq!(backend.read_buffer(&buffer).unwrap(), vec![5, 6, 9, 10]);

        let mut back = vec![0u8; 16];
        backend.copy_device_to_host(&buffer, &mut back, &rect).unwrap();
        assert_eq!(back[5], 5);
        assert_eq!(back[10], 10);
        assert_eq!(back[0], 0);

        let stats = backend.transfer_stats();
        assert_eq!(stats.h2d_bytes, 4);
        assert_eq!(stats.d2h_bytes, 4);
    }

    #[test]
    fn test_peer_copy_policy() {
        let backend = backend();
        let g0 = DeviceId::gpu(0);
        let g1 = DeviceId::gpu(1);
        let other = DeviceId::gpu(0).on_platform(1);

        assert!(backend.supports_peer_copy(g0, g0));
        assert!(backend.supports_peer_copy(g0, g1));
        assert!(!backend.supports_peer_copy(g0, other));

        let a = backend.allocate_buffer(g0, 8).unwrap();
        let b = backend.allocate_buffer(other, 8).unwrap();
        assert!(backend.copy_device_to_device(&a, 0, &b, 0, 8).is_err());

        let backend = backend.with_peer_copy(PeerCopy::Never);
        assert!(!backend.supports_peer_copy(g0, g1));
    }

    #[test]
    fn test_device_to_device_copy() {
        let backend = backend();
        let a = backend.allocate_buffer(DeviceId::gpu(0), 8).unwrap();
        let b = backend.allocate_buffer(DeviceId::gpu(1), 8).unwrap();
        backend.write_buffer(&a, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        backend.copy_device_to_device(&a, 2, &b, 0, 4).unwrap();
        assert_eq!(&backend.read_buffer(&b).unwrap()[..4], &[3, 4, 5, 6]);

        // Overlapping copy inside one allocation.
        backend.copy_device_to_device(&a, 0, &a, 1, 4).unwrap();
        assert_eq!(&backend.read_buffer(&a).unwrap()[..5], &[1, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let backend = backend();
        backend.inject_fault(FaultOp::Allocate, -5);

        let err = backend.allocate_buffer(DeviceId::gpu(0), 8).unwrap_err();
        assert_eq!(err.code(), Some(-5));
        assert!(!err.is_out_of_memory());
        assert!(backend.allocate_buffer(DeviceId::gpu(0), 8).is_ok());
    }

    #[test]
    fn test_map_elements() {
        let backend = backend();
        let buffer = backend.allocate_buffer(DeviceId::gpu(0), 16).unwrap();
        backend
            .write_buffer(&buffer, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]))
            .unwrap();

        backend.map_elements::<f32, _>(&buffer, |x| *x *= 2.0).unwrap();
        assert_eq!(
            backend.read_elements::<f32>(&buffer).unwrap(),
            vec![2.0, 4.0, 6.0, 8.0]
        );
    }
}
