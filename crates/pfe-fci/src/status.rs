//! FCI wire-protocol status codes.

use pfe_fp::FpError;
use std::fmt;

/// Status word returned to the FCI client.
///
/// Every internal error kind maps onto exactly one wire status; an
/// unrecognized action code gets its own status instead of a generic
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FciStatus {
    /// Command succeeded.
    Ok = 0,
    /// The command frame has the wrong size.
    WrongCommandSize = 1,
    /// The action code is not recognized.
    UnknownAction = 2,
    /// The entity is already registered.
    EntryAlreadyRegistered = 3,
    /// The entity does not exist, or a query is exhausted.
    EntryNotFound = 4,
    /// The entity is referenced elsewhere.
    EntryInUse = 5,
    /// Host or DMEM allocation failed.
    OutOfMemory = 6,
    /// The command payload is malformed.
    InvalidArgument = 7,
    /// Internal failure (hardware write rejected).
    InternalFailure = 8,
}

impl FciStatus {
    /// Returns the raw wire value.
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Returns true for `Ok`.
    pub const fn is_ok(&self) -> bool {
        matches!(self, FciStatus::Ok)
    }
}

impl fmt::Display for FciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FciStatus::Ok => "OK",
            FciStatus::WrongCommandSize => "WRONG_COMMAND_SIZE",
            FciStatus::UnknownAction => "UNKNOWN_ACTION",
            FciStatus::EntryAlreadyRegistered => "ENTRY_ALREADY_REGISTERED",
            FciStatus::EntryNotFound => "ENTRY_NOT_FOUND",
            FciStatus::EntryInUse => "ENTRY_IN_USE",
            FciStatus::OutOfMemory => "OUT_OF_MEMORY",
            FciStatus::InvalidArgument => "INVALID_ARGUMENT",
            FciStatus::InternalFailure => "INTERNAL_FAILURE",
        };
        write!(f, "{}", s)
    }
}

impl From<&FpError> for FciStatus {
    fn from(err: &FpError) -> FciStatus {
        match err {
            FpError::InvalidArgument { .. } => FciStatus::InvalidArgument,
            FpError::NotFound { .. } => FciStatus::EntryNotFound,
            FpError::AlreadyExists { .. } => FciStatus::EntryAlreadyRegistered,
            FpError::Busy { .. } => FciStatus::EntryInUse,
            FpError::OutOfMemory => FciStatus::OutOfMemory,
            FpError::Hardware(_) => FciStatus::InternalFailure,
        }
    }
}
