//! Engine counters.

use hetarray_compute::{TransferDirection, TransferStats};

/// Counters accumulated by a [`Coherence`](crate::Coherence) engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoherenceStats {
    /// Transfers issued, by direction. Parent/child host copies count as H2H.
    pub transfers: TransferStats,
    /// Device buffers released to make room for an allocation.
    pub evictions: u64,
    /// Parent rebuilds from children alone.
    pub simple_rebuilds: u64,
    /// Parent rebuilds over a fetched base copy.
    pub complex_rebuilds: u64,
    /// Halo copies performed by ghost synchronization.
    pub ghost_copies: u64,
    /// Sub-buffers created for children.
    pub sub_buffers_created: u64,
}

impl CoherenceStats {
    pub(crate) fn transfer(&mut self, direction: TransferDirection, bytes: usize) {
        self.transfers.record(direction, bytes as u64);
    }

    /// Number of transfers issued.
    pub fn transfer_count(&self) -> u64 {
        self.transfers.transfer_count
    }
}
