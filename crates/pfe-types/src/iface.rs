//! Interface identifiers and membership bitmaps.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// A physical or logical interface slot number (0-31).
///
/// The hardware addresses interfaces by a small integer ID; every
/// membership structure (forward list, untag list, mirror list) stores
/// the interface as a `1 << id` bit in a 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct InterfaceId(u8);

impl InterfaceId {
    /// Highest valid interface ID.
    pub const MAX: u32 = 31;

    /// Creates a new interface ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID does not fit the 32-bit bitmap convention.
    pub const fn new(id: u32) -> Result<Self, ParseError> {
        if id <= Self::MAX {
            Ok(InterfaceId(id as u8))
        } else {
            Err(ParseError::InvalidInterfaceId(id))
        }
    }

    /// Returns the raw slot number.
    pub const fn as_u32(&self) -> u32 {
        self.0 as u32
    }

    /// Returns this interface's position bit (`1 << id`).
    pub const fn bit(&self) -> u32 {
        1 << self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

impl TryFrom<u32> for InterfaceId {
    type Error = ParseError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        InterfaceId::new(id)
    }
}

impl From<InterfaceId> for u32 {
    fn from(id: InterfaceId) -> u32 {
        id.as_u32()
    }
}

/// A set of interfaces encoded as a 32-bit bitmap (`1 << id` per member).
///
/// # Examples
///
/// ```
/// use pfe_types::{IfaceBitmap, InterfaceId};
///
/// let mut fwd = IfaceBitmap::EMPTY;
/// let emac0 = InterfaceId::new(0).unwrap();
/// let hif = InterfaceId::new(6).unwrap();
///
/// fwd.set(emac0);
/// fwd.set(hif);
/// assert!(fwd.contains(emac0));
/// assert_eq!(fwd.as_u32(), 0x41);
///
/// fwd.clear(emac0);
/// assert!(!fwd.contains(emac0));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IfaceBitmap(u32);

impl IfaceBitmap {
    /// The empty set.
    pub const EMPTY: IfaceBitmap = IfaceBitmap(0);

    /// Creates a bitmap from a raw word.
    pub const fn from_raw(raw: u32) -> Self {
        IfaceBitmap(raw)
    }

    /// Returns the raw bitmap word.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Adds an interface to the set.
    pub fn set(&mut self, iface: InterfaceId) {
        self.0 |= iface.bit();
    }

    /// Removes an interface from the set.
    pub fn clear(&mut self, iface: InterfaceId) {
        self.0 &= !iface.bit();
    }

    /// Returns true if the interface is a member.
    pub const fn contains(&self, iface: InterfaceId) -> bool {
        self.0 & iface.bit() != 0
    }

    /// Returns true if no interface is a member.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the number of member interfaces.
    pub const fn len(&self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the member interface IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = InterfaceId> + '_ {
        let word = self.0;
        (0..=InterfaceId::MAX).filter_map(move |id| {
            if word & (1 << id) != 0 {
                InterfaceId::new(id).ok()
            } else {
                None
            }
        })
    }
}

impl BitOr for IfaceBitmap {
    type Output = IfaceBitmap;

    fn bitor(self, rhs: IfaceBitmap) -> IfaceBitmap {
        IfaceBitmap(self.0 | rhs.0)
    }
}

impl BitAnd for IfaceBitmap {
    type Output = IfaceBitmap;

    fn bitand(self, rhs: IfaceBitmap) -> IfaceBitmap {
        IfaceBitmap(self.0 & rhs.0)
    }
}

impl fmt::Display for IfaceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<InterfaceId> for IfaceBitmap {
    fn from(iface: InterfaceId) -> Self {
        IfaceBitmap(iface.bit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interface_id_range() {
        assert!(InterfaceId::new(0).is_ok());
        assert!(InterfaceId::new(31).is_ok());
        assert!(InterfaceId::new(32).is_err());
    }

    #[test]
    fn test_interface_bit_position() {
        assert_eq!(InterfaceId::new(0).unwrap().bit(), 0x1);
        assert_eq!(InterfaceId::new(5).unwrap().bit(), 0x20);
        assert_eq!(InterfaceId::new(31).unwrap().bit(), 0x8000_0000);
    }

    #[test]
    fn test_bitmap_set_clear_contains() {
        let a = InterfaceId::new(2).unwrap();
        let b = InterfaceId::new(7).unwrap();

        let mut map = IfaceBitmap::EMPTY;
        assert!(map.is_empty());

        map.set(a);
        map.set(b);
        assert!(map.contains(a));
        assert!(map.contains(b));
        assert_eq!(map.len(), 2);

        map.clear(a);
        assert!(!map.contains(a));
        assert!(map.contains(b));
    }

    #[test]
    fn test_bitmap_ops() {
        let a = IfaceBitmap::from_raw(0b0110);
        let b = IfaceBitmap::from_raw(0b0011);
        assert_eq!((a | b).as_u32(), 0b0111);
        assert_eq!((a & b).as_u32(), 0b0010);
    }

    #[test]
    fn test_bitmap_iter() {
        let mut map = IfaceBitmap::EMPTY;
        map.set(InterfaceId::new(1).unwrap());
        map.set(InterfaceId::new(4).unwrap());

        let ids: Vec<u32> = map.iter().map(|i| i.as_u32()).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_bitmap_display() {
        let map = IfaceBitmap::from_raw(0x41);
        assert_eq!(map.to_string(), "0x00000041");
    }
}
