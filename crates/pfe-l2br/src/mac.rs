//! MAC table and static-entry manager.
//!
//! The hardware MAC table uses the same hash-slot + collision-chain
//! structure as the VLAN table; one entry associates a (MAC, VLAN) pair
//! with a forward list and per-entry flags. Statically pinned entries are
//! additionally tracked in a host-side list so they survive the flushes
//! that remove aged/learned entries.

use crate::hash::{HashTable, SlotEntry, TableGeometry};
use crate::{L2BridgeError, L2brResult};
use byteorder::{ByteOrder, NetworkEndian};
use pfe_dmem::Dmem;
use pfe_types::{IfaceBitmap, InterfaceId, MacAddress, VlanId};
use tracing::{debug, warn};

/// MAC table lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacKey {
    /// Entry MAC address.
    pub mac: MacAddress,
    /// Entry VLAN.
    pub vlan: u16,
}

const FLAG_STATIC: u8 = 0x01;
const FLAG_FRESH: u8 = 0x02;
const FLAG_LOCAL_L3: u8 = 0x04;
const FLAG_SRC_DISCARD: u8 = 0x08;
const FLAG_DST_DISCARD: u8 = 0x10;

#[derive(Debug, Clone)]
pub(crate) struct MacEntry {
    key: MacKey,
    forward: IfaceBitmap,
    is_static: bool,
    fresh: bool,
    local_l3: bool,
    src_discard: bool,
    dst_discard: bool,
}

impl MacEntry {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_static {
            flags |= FLAG_STATIC;
        }
        if self.fresh {
            flags |= FLAG_FRESH;
        }
        if self.local_l3 {
            flags |= FLAG_LOCAL_L3;
        }
        if self.src_discard {
            flags |= FLAG_SRC_DISCARD;
        }
        if self.dst_discard {
            flags |= FLAG_DST_DISCARD;
        }
        flags
    }
}

impl SlotEntry for MacEntry {
    type Key = MacKey;
    const PAYLOAD_SIZE: usize = 14;

    fn key(&self) -> MacKey {
        self.key
    }

    fn slot_index(key: &MacKey, hash_slots: usize) -> usize {
        // Fold the MAC bytes and VLAN into the slot mask; any uniform
        // fold keeps the chain behavior of the hardware structure.
        let bytes = key.mac.as_bytes();
        let hi = (bytes[0] ^ bytes[2] ^ bytes[4]) as u16;
        let lo = (bytes[1] ^ bytes[3] ^ bytes[5]) as u16;
        let fold = ((hi << 8) | lo) ^ key.vlan;
        (fold as usize) & (hash_slots - 1)
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(self.key.mac.as_bytes());
        NetworkEndian::write_u16(&mut buf[6..8], self.key.vlan);
        NetworkEndian::write_u32(&mut buf[8..12], self.forward.as_u32());
        buf[12] = self.flags();
        // buf[13] reserved
    }
}

/// A read-only snapshot of a static MAC entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEntryInfo {
    /// Entry VLAN.
    pub vlan: VlanId,
    /// Entry MAC address.
    pub mac: MacAddress,
    /// Forward-list bitmap.
    pub forward: IfaceBitmap,
    /// Address belongs to the local L3 stack.
    pub local_l3: bool,
    /// Discard frames sourced from this address.
    pub src_discard: bool,
    /// Discard frames destined to this address.
    pub dst_discard: bool,
}

/// Caller-owned cursor over the static-entry list.
#[derive(Debug, Clone, Default)]
pub struct StaticEntryCursor {
    next_index: usize,
    last: Option<MacKey>,
}

impl StaticEntryCursor {
    /// Creates a cursor positioned before the first static entry.
    pub fn start() -> Self {
        Self::default()
    }
}

/// The bridge's MAC table manager.
pub struct MacTable {
    table: HashTable<MacEntry>,
    /// Insertion-ordered keys of statically pinned entries.
    statics: Vec<MacKey>,
}

impl MacTable {
    pub(crate) fn new(dmem: &mut dyn Dmem, geometry: TableGeometry) -> L2brResult<Self> {
        Ok(Self {
            table: HashTable::new(dmem, geometry)?,
            statics: Vec::new(),
        })
    }

    /// Creates a statically pinned MAC entry.
    ///
    /// The duplicate check runs against the static-entry list only; a
    /// dynamically learned entry with the same (VLAN, MAC) is overwritten
    /// by the hardware write. Whether it should instead block creation is
    /// an open interoperability question; the original driver behavior is
    /// kept.
    pub fn static_entry_create(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        forward: IfaceBitmap,
    ) -> L2brResult<()> {
        let key = MacKey {
            mac,
            vlan: vlan.as_u16(),
        };
        if self.statics.contains(&key) {
            return Err(L2BridgeError::already_exists(format!(
                "static entry {}@{}",
                mac, vlan
            )));
        }

        let entry = MacEntry {
            key,
            forward,
            is_static: true,
            fresh: false,
            local_l3: false,
            src_discard: false,
            dst_discard: false,
        };
        if self.table.contains(&key) {
            warn!(%mac, %vlan, "static entry replaces a learned entry");
            self.table.update(dmem, entry)?;
        } else {
            self.table.add(dmem, entry)?;
        }
        self.statics.push(key);
        debug!(%mac, %vlan, "static MAC entry created");
        Ok(())
    }

    /// Destroys a static MAC entry.
    pub fn static_entry_destroy(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
    ) -> L2brResult<()> {
        let key = MacKey {
            mac,
            vlan: vlan.as_u16(),
        };
        if !self.statics.contains(&key) {
            return Err(L2BridgeError::not_found(format!(
                "static entry {}@{}",
                mac, vlan
            )));
        }
        self.table.delete(dmem, &key)?;
        self.statics.retain(|k| k != &key);
        debug!(%mac, %vlan, "static MAC entry destroyed");
        Ok(())
    }

    fn set_static_flag(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        apply: impl FnOnce(&mut MacEntry),
    ) -> L2brResult<()> {
        let key = MacKey {
            mac,
            vlan: vlan.as_u16(),
        };
        if !self.statics.contains(&key) {
            return Err(L2BridgeError::not_found(format!(
                "static entry {}@{}",
                mac, vlan
            )));
        }
        let mut entry = self
            .table
            .get(&key)
            .cloned()
            .ok_or_else(|| L2BridgeError::not_found(format!("static entry {}@{}", mac, vlan)))?;
        apply(&mut entry);
        // A rejected write leaves the table shadow untouched, so the
        // in-memory flag value rolls back with it.
        self.table.update(dmem, entry)
    }

    /// Marks or unmarks the entry as a local L3 address.
    pub fn static_entry_set_local_l3(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        enable: bool,
    ) -> L2brResult<()> {
        self.set_static_flag(dmem, vlan, mac, |entry| entry.local_l3 = enable)
    }

    /// Enables or disables source-address discard.
    pub fn static_entry_set_src_discard(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        enable: bool,
    ) -> L2brResult<()> {
        self.set_static_flag(dmem, vlan, mac, |entry| entry.src_discard = enable)
    }

    /// Enables or disables destination-address discard.
    pub fn static_entry_set_dst_discard(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        enable: bool,
    ) -> L2brResult<()> {
        self.set_static_flag(dmem, vlan, mac, |entry| entry.dst_discard = enable)
    }

    /// Records a dynamically learned MAC on `iface`.
    ///
    /// A learned entry tracks the single interface the address was last
    /// seen on; re-learning moves it. Learning never touches a static
    /// entry.
    pub fn learn(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        iface: InterfaceId,
    ) -> L2brResult<()> {
        let key = MacKey {
            mac,
            vlan: vlan.as_u16(),
        };
        let entry = MacEntry {
            key,
            forward: IfaceBitmap::from(iface),
            is_static: false,
            fresh: true,
            local_l3: false,
            src_discard: false,
            dst_discard: false,
        };
        match self.table.get(&key) {
            Some(existing) if existing.is_static => {
                warn!(%mac, %vlan, "ignoring learn event for a static entry");
                Ok(())
            }
            Some(_) => self.table.update(dmem, entry),
            None => self.table.add(dmem, entry),
        }
    }

    /// Returns the forward list of an entry, if present.
    pub fn lookup(&self, vlan: VlanId, mac: MacAddress) -> Option<IfaceBitmap> {
        let key = MacKey {
            mac,
            vlan: vlan.as_u16(),
        };
        self.table.get(&key).map(|entry| entry.forward)
    }

    /// Total number of entries (static and learned).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Number of static entries.
    pub fn static_count(&self) -> usize {
        self.statics.len()
    }

    fn delete_keys(&mut self, dmem: &mut dyn Dmem, keys: &[MacKey]) -> L2brResult<usize> {
        for key in keys {
            self.table.delete(dmem, key)?;
        }
        Ok(keys.len())
    }

    /// Removes every learned (non-static) entry. Returns the count.
    pub fn flush_learned(&mut self, dmem: &mut dyn Dmem) -> L2brResult<usize> {
        let keys = self.table.keys_where(|entry| !entry.is_static);
        self.delete_keys(dmem, &keys)
    }

    /// Removes every static entry. Returns the count.
    pub fn flush_static(&mut self, dmem: &mut dyn Dmem) -> L2brResult<usize> {
        let keys: Vec<MacKey> = self.statics.clone();
        let count = self.delete_keys(dmem, &keys)?;
        self.statics.clear();
        Ok(count)
    }

    /// Removes everything and re-initializes the hardware table.
    ///
    /// The table is rewritten slot by slot instead of issuing the
    /// hardware flush command, which hangs the engine.
    pub fn flush_all(&mut self, dmem: &mut dyn Dmem) -> L2brResult<usize> {
        let count = self.table.len();
        self.table.reset(dmem)?;
        self.statics.clear();
        Ok(count)
    }

    /// Removes every entry of `vlan` whose forward list contains `iface`,
    /// static and learned alike. Returns the count.
    pub fn flush_domain_if(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        iface: InterfaceId,
    ) -> L2brResult<usize> {
        let raw_vlan = vlan.as_u16();
        let keys = self
            .table
            .keys_where(|entry| entry.key.vlan == raw_vlan && entry.forward.contains(iface));
        let count = self.delete_keys(dmem, &keys)?;
        self.statics.retain(|k| !keys.contains(k));
        Ok(count)
    }

    /// Advances a static-entry cursor, returning the next snapshot.
    ///
    /// The cursor tolerates entry destroys between calls by re-syncing on
    /// the last returned key.
    pub fn next_static_entry(&self, cursor: &mut StaticEntryCursor) -> Option<StaticEntryInfo> {
        let index = match cursor.last {
            None => 0,
            Some(last) => match self.statics.iter().position(|k| *k == last) {
                Some(pos) => pos + 1,
                None => cursor.next_index.saturating_sub(1),
            },
        };
        let key = *self.statics.get(index)?;
        let entry = self.table.get(&key)?;
        cursor.last = Some(key);
        cursor.next_index = index + 1;
        Some(StaticEntryInfo {
            vlan: VlanId::new(key.vlan).ok()?,
            mac: key.mac,
            forward: entry.forward,
            local_l3: entry.local_l3,
            src_discard: entry.src_discard,
            dst_discard: entry.dst_discard,
        })
    }

    pub(crate) fn release(&mut self, dmem: &mut dyn Dmem) -> L2brResult<()> {
        self.table.release(dmem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfe_dmem::HostDmem;
    use pretty_assertions::assert_eq;

    const GEOMETRY: TableGeometry = TableGeometry {
        hash_slots: 16,
        collision_slots: 16,
    };

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn iface(id: u32) -> InterfaceId {
        InterfaceId::new(id).unwrap()
    }

    fn fwd(ids: &[u32]) -> IfaceBitmap {
        let mut map = IfaceBitmap::EMPTY;
        for id in ids {
            map.set(iface(*id));
        }
        map
    }

    fn table(dmem: &mut HostDmem) -> MacTable {
        MacTable::new(dmem, GEOMETRY).unwrap()
    }

    #[test]
    fn test_static_entry_duplicate() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);

        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();
        let err = tbl
            .static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[1]))
            .unwrap_err();
        assert!(matches!(err, L2BridgeError::AlreadyExists { .. }));

        // Same MAC in a different VLAN is a different entry.
        tbl.static_entry_create(&mut dmem, vlan(200), mac(1), fwd(&[0]))
            .unwrap();
        assert_eq!(tbl.static_count(), 2);
    }

    #[test]
    fn test_static_entry_destroy() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);

        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();
        tbl.static_entry_destroy(&mut dmem, vlan(100), mac(1)).unwrap();
        assert_eq!(tbl.len(), 0);
        assert!(matches!(
            tbl.static_entry_destroy(&mut dmem, vlan(100), mac(1)),
            Err(L2BridgeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_static_replaces_learned() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);

        tbl.learn(&mut dmem, vlan(100), mac(1), iface(3)).unwrap();
        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0, 1]))
            .unwrap();

        assert_eq!(tbl.len(), 1);
        assert_eq!(tbl.lookup(vlan(100), mac(1)), Some(fwd(&[0, 1])));
        // Now a static entry: flush_learned keeps it.
        assert_eq!(tbl.flush_learned(&mut dmem).unwrap(), 0);
        assert_eq!(tbl.len(), 1);
    }

    #[test]
    fn test_learn_moves_entry() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);

        tbl.learn(&mut dmem, vlan(100), mac(1), iface(3)).unwrap();
        assert_eq!(tbl.lookup(vlan(100), mac(1)), Some(fwd(&[3])));

        tbl.learn(&mut dmem, vlan(100), mac(1), iface(5)).unwrap();
        assert_eq!(tbl.lookup(vlan(100), mac(1)), Some(fwd(&[5])));
        assert_eq!(tbl.len(), 1);
    }

    #[test]
    fn test_learn_does_not_touch_static() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);

        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();
        tbl.learn(&mut dmem, vlan(100), mac(1), iface(7)).unwrap();
        assert_eq!(tbl.lookup(vlan(100), mac(1)), Some(fwd(&[0])));
    }

    #[test]
    fn test_flag_setters() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);
        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();

        tbl.static_entry_set_local_l3(&mut dmem, vlan(100), mac(1), true)
            .unwrap();
        tbl.static_entry_set_src_discard(&mut dmem, vlan(100), mac(1), true)
            .unwrap();

        let mut cursor = StaticEntryCursor::start();
        let info = tbl.next_static_entry(&mut cursor).unwrap();
        assert!(info.local_l3);
        assert!(info.src_discard);
        assert!(!info.dst_discard);

        assert!(matches!(
            tbl.static_entry_set_local_l3(&mut dmem, vlan(100), mac(9), true),
            Err(L2BridgeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_flag_setter_hw_failure_rolls_back() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);
        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();

        dmem.inject_write_faults(1);
        assert!(tbl
            .static_entry_set_dst_discard(&mut dmem, vlan(100), mac(1), true)
            .is_err());

        let mut cursor = StaticEntryCursor::start();
        let info = tbl.next_static_entry(&mut cursor).unwrap();
        assert!(!info.dst_discard);
    }

    #[test]
    fn test_flush_semantics_differentiation() {
        let mut dmem = HostDmem::new(8192);

        // flush_learned removes only the learned entry.
        let mut tbl = table(&mut dmem);
        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();
        tbl.learn(&mut dmem, vlan(100), mac(2), iface(1)).unwrap();
        assert_eq!(tbl.flush_learned(&mut dmem).unwrap(), 1);
        assert_eq!(tbl.len(), 1);
        assert_eq!(tbl.static_count(), 1);

        // flush_static removes only the static entry.
        tbl.learn(&mut dmem, vlan(100), mac(2), iface(1)).unwrap();
        assert_eq!(tbl.flush_static(&mut dmem).unwrap(), 1);
        assert_eq!(tbl.len(), 1);
        assert_eq!(tbl.static_count(), 0);

        // flush_all removes both.
        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[0]))
            .unwrap();
        assert_eq!(tbl.flush_all(&mut dmem).unwrap(), 2);
        assert_eq!(tbl.len(), 0);
        assert_eq!(tbl.static_count(), 0);
    }

    #[test]
    fn test_flush_domain_if() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);

        // VLAN 100 on iface 1: one static, one learned.
        tbl.static_entry_create(&mut dmem, vlan(100), mac(1), fwd(&[1]))
            .unwrap();
        tbl.learn(&mut dmem, vlan(100), mac(2), iface(1)).unwrap();
        // Same VLAN, different interface; and another VLAN on iface 1.
        tbl.learn(&mut dmem, vlan(100), mac(3), iface(2)).unwrap();
        tbl.learn(&mut dmem, vlan(200), mac(4), iface(1)).unwrap();

        let removed = tbl.flush_domain_if(&mut dmem, vlan(100), iface(1)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(tbl.static_count(), 0);
        assert!(tbl.lookup(vlan(100), mac(3)).is_some());
        assert!(tbl.lookup(vlan(200), mac(4)).is_some());
    }

    #[test]
    fn test_static_cursor_skips_destroyed() {
        let mut dmem = HostDmem::new(8192);
        let mut tbl = table(&mut dmem);
        for last in [1, 2, 3] {
            tbl.static_entry_create(&mut dmem, vlan(100), mac(last), fwd(&[0]))
                .unwrap();
        }

        let mut cursor = StaticEntryCursor::start();
        assert_eq!(tbl.next_static_entry(&mut cursor).unwrap().mac, mac(1));
        assert_eq!(tbl.next_static_entry(&mut cursor).unwrap().mac, mac(2));

        tbl.static_entry_destroy(&mut dmem, vlan(100), mac(2)).unwrap();
        assert_eq!(tbl.next_static_entry(&mut cursor).unwrap().mac, mac(3));
        assert!(tbl.next_static_entry(&mut cursor).is_none());
    }
}
