//! L2 bridge domain engine of the PFE driver.
//!
//! A bridge instance manages VLAN-scoped forwarding domains (one default,
//! one fall-back, any number of standard per-VLAN domains), the interface
//! membership and hit/miss actions of each, and the MAC table with its
//! statically pinned entries. Domain and MAC state is mirrored into
//! hash-indexed tables in PE data memory with explicit collision-chain
//! management, reproducing the hardware lookup structure in software when
//! hardware hashing is disabled.
//!
//! All mutations write hardware first and commit the host shadow only on
//! success, so a rejected DMEM write leaves the previous valid
//! configuration on both sides.

mod domain;
mod error;
mod hash;
mod mac;
mod types;

pub use domain::{BridgeConfig, DomainCursor, L2Bridge};
pub use error::{L2BridgeError, L2brResult};
pub use hash::{TableGeometry, SLOT_LINK_NONE};
pub use mac::{MacKey, MacTable, StaticEntryCursor, StaticEntryInfo};
pub use types::{
    BridgeDomainInfo, DomainAction, DomainActions, DomainKind, DomainSel, SHARED_STATS_INDEX,
};
