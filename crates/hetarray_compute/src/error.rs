//! Unified error types for hetarray_compute.

/// Result type for backend operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Error code reported alongside [`ComputeError::OutOfMemory`] when it has to
/// be surfaced as a numeric backend code (mirrors `CL_MEM_OBJECT_ALLOCATION_FAILURE`).
pub const OUT_OF_MEMORY_CODE: i32 = -4;

/// Unified error type for all backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    /// Device not found or not attached to the backend.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Out of memory on device.
    #[error("Out of memory on {device}: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        /// Device the allocation targeted.
        device: String,
        /// Requested memory in bytes.
        requested: u64,
        /// Available memory in bytes.
        available: u64,
    },

    /// Buffer operation error (bad sub-range, foreign buffer, ...).
    #[error("Buffer error: {0}")]
    BufferError(String),

    /// Data transfer error (out-of-bounds rectangle, pitch mismatch, ...).
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend-specific failure carrying the native error code.
    #[error("{backend} error in {operation}: code {code}")]
    Backend {
        /// Which backend produced the error.
        backend: &'static str,
        /// Operation that failed (`allocate`, `copy_host_to_device`, ...).
        operation: &'static str,
        /// Native error code.
        code: i32,
    },
}

impl ComputeError {
    /// Create a backend-specific error.
    pub fn backend(backend: &'static str, operation: &'static str, code: i32) -> Self {
        ComputeError::Backend {
            backend,
            operation,
            code,
        }
    }

    /// Create an out of memory error.
    pub fn oom(device: impl Into<String>, requested: u64, available: u64) -> Self {
        ComputeError::OutOfMemory {
            device: device.into(),
            requested,
            available,
        }
    }

    /// Whether this error asks the caller to free memory and retry.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ComputeError::OutOfMemory { .. })
    }

    /// Native error code, when the backend reported one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ComputeError::Backend { code, .. } => Some(*code),
            ComputeError::OutOfMemory { .. } => Some(OUT_OF_MEMORY_CODE),
            _ => None,
        }
    }
}
