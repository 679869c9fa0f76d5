//! L2 bridge error types.

use pfe_dmem::DmemError;
use thiserror::Error;

/// Result type for bridge operations.
pub type L2brResult<T> = Result<T, L2BridgeError>;

/// Errors reported by the bridge domain engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum L2BridgeError {
    /// Malformed or contradictory input.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request.
        reason: String,
    },

    /// The addressed domain, member, or entry does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What failed to resolve.
        what: String,
    },

    /// The domain, member, or entry already exists.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// The colliding identity.
        what: String,
    },

    /// The hash table's collision region is exhausted.
    #[error("out of memory: {what}")]
    OutOfMemory {
        /// The resource that ran out.
        what: String,
    },

    /// The DMEM layer rejected an access.
    #[error("hardware access failed: {0}")]
    Hardware(#[from] DmemError),
}

impl L2BridgeError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        L2BridgeError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        L2BridgeError::NotFound { what: what.into() }
    }

    /// Creates an already-exists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        L2BridgeError::AlreadyExists { what: what.into() }
    }

    /// Creates an out-of-memory error.
    pub fn out_of_memory(what: impl Into<String>) -> Self {
        L2BridgeError::OutOfMemory { what: what.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = L2BridgeError::already_exists("domain 100");
        assert_eq!(err.to_string(), "already exists: domain 100");

        let err: L2BridgeError = DmemError::bad_address(0x8).into();
        assert!(err.to_string().starts_with("hardware access failed"));
    }
}
