//! DMEM error types.
//!
//! Every fallible DMEM operation reports one of these errors instead of
//! panicking; the firmware side never sees a partially applied request.

use thiserror::Error;

/// Result type for DMEM operations.
pub type DmemResult<T> = Result<T, DmemError>;

/// Errors reported by the DMEM access layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmemError {
    /// The region cannot satisfy the requested allocation.
    #[error("DMEM exhausted: {requested} bytes requested")]
    OutOfMemory {
        /// Size of the failed allocation in bytes.
        requested: usize,
    },

    /// An access touched bytes outside the region.
    #[error("DMEM access out of bounds: {len} bytes at {addr:#010x}")]
    OutOfBounds {
        /// Start address of the access.
        addr: u32,
        /// Length of the access in bytes.
        len: usize,
    },

    /// The address does not name a live allocation.
    #[error("bad DMEM address: {addr:#010x}")]
    BadAddress {
        /// The offending address.
        addr: u32,
    },

    /// The memory layer rejected the write.
    #[error("DMEM write failed at {addr:#010x}")]
    WriteFailed {
        /// Start address of the rejected write.
        addr: u32,
    },
}

impl DmemError {
    /// Creates an out-of-memory error.
    pub fn out_of_memory(requested: usize) -> Self {
        DmemError::OutOfMemory { requested }
    }

    /// Creates an out-of-bounds error.
    pub fn out_of_bounds(addr: u32, len: usize) -> Self {
        DmemError::OutOfBounds { addr, len }
    }

    /// Creates a bad-address error.
    pub fn bad_address(addr: u32) -> Self {
        DmemError::BadAddress { addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DmemError::out_of_memory(128);
        assert_eq!(err.to_string(), "DMEM exhausted: 128 bytes requested");

        let err = DmemError::out_of_bounds(0x100, 16);
        assert_eq!(err.to_string(), "DMEM access out of bounds: 16 bytes at 0x00000100");
    }
}
