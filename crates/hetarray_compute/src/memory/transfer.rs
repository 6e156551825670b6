//! Transfer bookkeeping.

use std::fmt;

use crate::device::Location;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Host to device.
    HostToDevice,
    /// Device to host.
    DeviceToHost,
    /// Device to device (same device).
    DeviceToDeviceSame,
    /// Device to device (different devices, direct).
    DeviceToDevicePeer,
    /// Host memory to host memory (region extraction / overlay).
    HostToHost,
}

impl TransferDirection {
    /// Classify a copy from `src` to `dst`.
    pub fn between(src: Location, dst: Location) -> Self {
        match (src, dst) {
            (Location::Host, Location::Host) => TransferDirection::HostToHost,
            (Location::Host, Location::Device(_)) => TransferDirection::HostToDevice,
            (Location::Device(_), Location::Host) => TransferDirection::DeviceToHost,
            (Location::Device(a), Location::Device(b)) if a == b => {
                TransferDirection::DeviceToDeviceSame
            }
            (Location::Device(_), Location::Device(_)) => TransferDirection::DeviceToDevicePeer,
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => write!(f, "H2D"),
            TransferDirection::DeviceToHost => write!(f, "D2H"),
            TransferDirection::DeviceToDeviceSame => write!(f, "D2D"),
            TransferDirection::DeviceToDevicePeer => write!(f, "P2P"),
            TransferDirection::HostToHost => write!(f, "H2H"),
        }
    }
}

/// Transfer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Total bytes transferred.
    pub total_bytes: u64,
    /// Number of transfers.
    pub transfer_count: u64,
    /// Bytes transferred host to device.
    pub h2d_bytes: u64,
    /// Bytes transferred device to host.
    pub d2h_bytes: u64,
    /// Bytes transferred device to device (same device or peer).
    pub d2d_bytes: u64,
    /// Bytes moved between host regions.
    pub h2h_bytes: u64,
}

impl TransferStats {
    /// Account one transfer.
    pub fn record(&mut self, direction: TransferDirection, bytes: u64) {
        self.total_bytes += bytes;
        self.transfer_count += 1;
        match direction {
            TransferDirection::HostToDevice => self.h2d_bytes += bytes,
            TransferDirection::DeviceToHost => self.d2h_bytes += bytes,
            TransferDirection::DeviceToDeviceSame | TransferDirection::DeviceToDevicePeer => {
                self.d2d_bytes += bytes
            }
            TransferDirection::HostToHost => self.h2h_bytes += bytes,
        }
    }
}
