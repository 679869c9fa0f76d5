//! Bridge domain types.

use pfe_types::{IfaceBitmap, InterfaceId, VlanId};
use std::fmt;
use tracing::warn;

/// What the bridge does with a frame for one lookup outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DomainAction {
    /// Forward to the interfaces on the forward list.
    Forward = 0,
    /// Flood to every interface in the domain.
    Flood = 1,
    /// Punt to the host interface.
    Punt = 2,
    /// Drop the frame.
    #[default]
    Discard = 3,
}

impl DomainAction {
    const fn from_bits(bits: u8) -> DomainAction {
        match bits & 0x3 {
            0 => DomainAction::Forward,
            1 => DomainAction::Flood,
            2 => DomainAction::Punt,
            _ => DomainAction::Discard,
        }
    }
}

impl fmt::Display for DomainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainAction::Forward => "forward",
            DomainAction::Flood => "flood",
            DomainAction::Punt => "punt",
            DomainAction::Discard => "discard",
        };
        write!(f, "{}", s)
    }
}

/// The four independent hit/miss actions of a bridge domain.
///
/// The hardware keeps all four in one action word; updates always
/// read-modify-write the whole word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainActions {
    /// Known unicast destination.
    pub ucast_hit: DomainAction,
    /// Unknown unicast destination.
    pub ucast_miss: DomainAction,
    /// Known multicast destination.
    pub mcast_hit: DomainAction,
    /// Unknown multicast destination.
    pub mcast_miss: DomainAction,
}

impl DomainActions {
    /// All four actions set to discard (the initial domain configuration).
    pub const DISCARD_ALL: DomainActions = DomainActions {
        ucast_hit: DomainAction::Discard,
        ucast_miss: DomainAction::Discard,
        mcast_hit: DomainAction::Discard,
        mcast_miss: DomainAction::Discard,
    };

    /// Packs the four 2-bit fields into the hardware action word.
    pub const fn pack(&self) -> u8 {
        (self.ucast_hit as u8)
            | ((self.ucast_miss as u8) << 2)
            | ((self.mcast_hit as u8) << 4)
            | ((self.mcast_miss as u8) << 6)
    }

    /// Unpacks a hardware action word.
    pub const fn unpack(word: u8) -> DomainActions {
        DomainActions {
            ucast_hit: DomainAction::from_bits(word),
            ucast_miss: DomainAction::from_bits(word >> 2),
            mcast_hit: DomainAction::from_bits(word >> 4),
            mcast_miss: DomainAction::from_bits(word >> 6),
        }
    }
}

/// Bridge domain role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    /// The bridge's default domain, created at bring-up.
    Default,
    /// Catches traffic whose VLAN matches no standard domain.
    FallBack,
    /// A user-created per-VLAN domain.
    Standard,
}

/// Selects a bridge domain for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainSel {
    /// The fall-back domain.
    FallBack,
    /// The domain of this VLAN (the default domain is addressed by its VLAN).
    Vlan(VlanId),
}

impl fmt::Display for DomainSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainSel::FallBack => write!(f, "fall-back domain"),
            DomainSel::Vlan(vlan) => write!(f, "domain {}", vlan),
        }
    }
}

/// A read-only snapshot of a bridge domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDomainInfo {
    /// Domain VLAN; `None` for the fall-back domain.
    pub vlan: Option<VlanId>,
    /// Domain role.
    pub kind: DomainKind,
    /// Forward-list bitmap.
    pub forward: IfaceBitmap,
    /// Untag-list bitmap.
    pub untag: IfaceBitmap,
    /// Hit/miss actions.
    pub actions: DomainActions,
    /// Statistics-table index assigned to the domain.
    pub stats_index: u8,
    /// Member interfaces with their tagging flag.
    pub members: Vec<(InterfaceId, bool)>,
}

/// Pool of per-domain statistics-table indices.
///
/// Index 0 is the shared fall-back slot: when the pool is exhausted,
/// additional domains account into slot 0 instead of failing creation.
#[derive(Debug)]
pub(crate) struct StatsIndexPool {
    bitmap: u32,
    size: u8,
}

/// The shared statistics slot used after pool exhaustion.
pub const SHARED_STATS_INDEX: u8 = 0;

impl StatsIndexPool {
    pub(crate) fn new(size: u8) -> Self {
        debug_assert!(size <= 32);
        // Slot 0 is permanently taken by the shared fall-back index.
        Self { bitmap: 0x1, size }
    }

    /// Allocates the lowest free index, or the shared index when full.
    pub(crate) fn alloc(&mut self) -> u8 {
        for idx in 1..self.size {
            let bit = 1u32 << idx;
            if self.bitmap & bit == 0 {
                self.bitmap |= bit;
                return idx;
            }
        }
        warn!("statistics index pool exhausted, using shared index");
        SHARED_STATS_INDEX
    }

    /// Returns an index to the pool. The shared index is never released.
    pub(crate) fn release(&mut self, idx: u8) {
        if idx == SHARED_STATS_INDEX || idx >= self.size {
            return;
        }
        self.bitmap &= !(1u32 << idx);
    }
}
