//! Error types for the coherency engine.

use hetarray_compute::{ComputeError, Location};

use crate::array::ArrayId;

/// Result type for coherency operations.
pub type CoherenceResult<T> = Result<T, CoherenceError>;

/// Errors surfaced by the coherency engine.
///
/// Every error aborts only the operation in flight. Validity bits are set
/// after the transfer that justifies them completes, so a failed call never
/// leaves a location marked valid with stale contents.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoherenceError {
    /// A backend operation failed with something other than out-of-memory.
    /// Not retried.
    #[error("backend failure in {operation} (code {code:?}): {source}")]
    BackendFailure {
        /// Engine operation that issued the backend call.
        operation: &'static str,
        /// Native backend code, when one was reported.
        code: Option<i32>,
        /// Underlying backend error.
        source: ComputeError,
    },

    /// Allocation failed and nothing left at the location could be evicted.
    #[error("out of device memory at {location}: no evictable buffer left for {requested} bytes")]
    EvictionExhausted {
        /// Location the allocation targeted.
        location: Location,
        /// Requested size in bytes.
        requested: usize,
    },

    /// The coherence protocol reached a state it cannot continue from
    /// (no valid copy, malformed region, unsupported overlap).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The handle does not name a live array.
    #[error("unknown array {0}")]
    UnknownArray(ArrayId),

    /// A location names a device the backend does not have.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoherenceError {
    /// Wrap a backend error raised during `operation`.
    ///
    /// Missing devices are configuration errors, everything else is a
    /// backend failure carrying the native code.
    pub fn backend(operation: &'static str, err: ComputeError) -> Self {
        match err {
            ComputeError::DeviceNotFound(device) => {
                CoherenceError::Configuration(format!("no device {} present", device))
            }
            other => CoherenceError::BackendFailure {
                operation,
                code: other.code(),
                source: other,
            },
        }
    }

    /// Create a protocol violation.
    pub fn violation(message: impl Into<String>) -> Self {
        CoherenceError::ProtocolViolation(message.into())
    }

    /// Whether the error reflects a broken invariant or exhausted resource
    /// rather than a transient backend condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoherenceError::EvictionExhausted { .. } | CoherenceError::ProtocolViolation(_)
        )
    }

    /// Native backend code, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            CoherenceError::BackendFailure { code, .. } => *code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetarray_compute::DeviceId;

    #[test]
    fn test_backend_error_mapping() {
        let err = CoherenceError::backend(
            "copy_host_to_device",
            ComputeError::backend("emulated", "copy_host_to_device", -5),
        );
        assert_eq!(err.code(), Some(-5));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("copy_host_to_device"));

        let err = CoherenceError::backend(
            "allocate",
            ComputeError::DeviceNotFound("p0:GPU:3".to_string()),
        );
        assert!(matches!(err, CoherenceError::Configuration(_)));
    }

    #[test]
    fn test_fatal_errors() {
        let err = CoherenceError::EvictionExhausted {
            location: Location::Device(DeviceId::gpu(0)),
            requested: 64,
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("p0:GPU:0"));
        assert!(CoherenceError::violation("no valid copy").is_fatal());
    }
}
