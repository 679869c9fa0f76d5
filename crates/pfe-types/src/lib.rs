//! Common types for the PFE driver control plane.
//!
//! This crate provides type-safe representations of the primitives shared
//! by the classifier, bridge, and FCI crates:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`InterfaceId`]: physical/logical interface slot numbers
//! - [`IfaceBitmap`]: per-interface membership bitmaps (`1 << id` convention)

mod iface;
mod mac;
mod vlan;

pub use iface::{IfaceBitmap, InterfaceId};
pub use mac::MacAddress;
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid interface ID: {0} (must be 0-31)")]
    InvalidInterfaceId(u32),
}
