//! Flexible Parser error types.

use pfe_dmem::DmemError;
use thiserror::Error;

/// Result type for Flexible Parser operations.
pub type FpResult<T> = Result<T, FpError>;

/// Errors reported by the rule/table database and the table pusher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FpError {
    /// Malformed or contradictory input.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request.
        reason: String,
    },

    /// The named entity does not exist (or a query is exhausted).
    #[error("not found: {name}")]
    NotFound {
        /// The name that failed to resolve.
        name: String,
    },

    /// The name is already taken.
    #[error("already exists: {name}")]
    AlreadyExists {
        /// The colliding name.
        name: String,
    },

    /// The entity is referenced elsewhere and cannot be changed.
    #[error("busy: {name}: {reason}")]
    Busy {
        /// The entity blocking the operation.
        name: String,
        /// Why it is blocked.
        reason: String,
    },

    /// Host or DMEM allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The DMEM layer rejected an access.
    #[error("hardware access failed: {0}")]
    Hardware(#[from] DmemError),
}

impl FpError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        FpError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        FpError::NotFound { name: name.into() }
    }

    /// Creates an already-exists error.
    pub fn already_exists(name: impl Into<String>) -> Self {
        FpError::AlreadyExists { name: name.into() }
    }

    /// Creates a busy error.
    pub fn busy(name: impl Into<String>, reason: impl Into<String>) -> Self {
        FpError::Busy {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
