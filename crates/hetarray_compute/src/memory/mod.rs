//! Memory management abstractions.
//!
//! This module provides the buffer handle trait, rectangular copy
//! descriptors, per-device memory accounting and transfer statistics.

mod buffer;
mod pool;
mod transfer;

pub use buffer::*;
pub use pool::*;
pub use transfer::*;
