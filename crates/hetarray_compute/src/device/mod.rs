//! Device abstractions for heterogeneous compute.
//!
//! A device is named by the triple `(platform, kind, index)`. Together with
//! the host it forms the set of [`Location`]s an array can be resident in.

mod location;

pub use location::*;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, ComputeResult};

/// Maximum number of platforms (vendor runtimes) addressable at once.
pub const MAX_PLATFORMS: u8 = 4;

/// Maximum number of devices of one kind on one platform.
pub const MAX_DEVICES_PER_KIND: u8 = 5;

/// Kind of device, as reported by the platform runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceKind {
    /// CPU exposed as a compute device.
    Cpu = 0,
    /// Graphics processor.
    Gpu = 1,
    /// Other co-processor (FPGA, DSP, many-core card).
    Accelerator = 2,
}

impl DeviceKind {
    /// Number of device kinds.
    pub const COUNT: u8 = 3;

    /// All kinds, in slot order.
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Accelerator];

    /// Check if this is a GPU device kind.
    pub fn is_gpu(&self) -> bool {
        matches!(self, DeviceKind::Gpu)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU"),
            DeviceKind::Accelerator => write!(f, "ACC"),
        }
    }
}

/// Unique device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    platform: u8,
    kind: DeviceKind,
    index: u8,
}

impl DeviceId {
    /// Create a device ID, validating it against the addressable range.
    pub fn new(platform: u8, kind: DeviceKind, index: u8) -> ComputeResult<Self> {
        if platform >= MAX_PLATFORMS {
            return Err(ComputeError::InvalidConfig(format!(
                "platform {} out of range (max {})",
                platform,
                MAX_PLATFORMS - 1
            )));
        }
        if index >= MAX_DEVICES_PER_KIND {
            return Err(ComputeError::InvalidConfig(format!(
                "device index {} out of range (max {})",
                index,
                MAX_DEVICES_PER_KIND - 1
            )));
        }
        Ok(Self {
            platform,
            kind,
            index,
        })
    }

    const fn checked(platform: u8, kind: DeviceKind, index: u8) -> Self {
        assert!(platform < MAX_PLATFORMS, "platform out of range");
        assert!(index < MAX_DEVICES_PER_KIND, "device index out of range");
        Self {
            platform,
            kind,
            index,
        }
    }

    /// GPU `index` on platform 0.
    ///
    /// # Panics
    /// If `index >= MAX_DEVICES_PER_KIND`.
    pub const fn gpu(index: u8) -> Self {
        Self::checked(0, DeviceKind::Gpu, index)
    }

    /// CPU device `index` on platform 0.
    ///
    /// # Panics
    /// If `index >= MAX_DEVICES_PER_KIND`.
    pub const fn cpu(index: u8) -> Self {
        Self::checked(0, DeviceKind::Cpu, index)
    }

    /// Accelerator `index` on platform 0.
    ///
    /// # Panics
    /// If `index >= MAX_DEVICES_PER_KIND`.
    pub const fn accelerator(index: u8) -> Self {
        Self::checked(0, DeviceKind::Accelerator, index)
    }

    /// Same kind and index, on another platform.
    ///
    /// # Panics
    /// If `platform >= MAX_PLATFORMS`.
    pub const fn on_platform(self, platform: u8) -> Self {
        Self::checked(platform, self.kind, self.index)
    }

    /// Platform index.
    pub fn platform(&self) -> u8 {
        self.platform
    }

    /// Device kind.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Index within `(platform, kind)`.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Dense slot number, unique per device and always below [`HOST_SLOT`].
    pub fn slot(&self) -> usize {
        let per_platform = (DeviceKind::COUNT * MAX_DEVICES_PER_KIND) as usize;
        self.platform as usize * per_platform
            + self.kind as usize * MAX_DEVICES_PER_KIND as usize
            + self.index as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}:{}:{}", self.platform, self.kind, self.index)
    }
}

/// Static description of an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identity.
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// Total allocatable memory (bytes).
    pub total_memory: u64,
    /// Required byte alignment of sub-buffer origins.
    pub sub_buffer_alignment: usize,
}
