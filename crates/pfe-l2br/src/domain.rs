//! Bridge instance and domain lifecycle.
//!
//! A bridge owns one default domain, one fall-back domain, and any number
//! of user-created standard domains keyed by VLAN. Every domain mutation
//! is pushed into the hash-indexed VLAN table before the host shadow is
//! updated, so a rejected hardware write leaves the previous valid
//! configuration on both sides.

use crate::hash::{HashTable, SlotEntry, TableGeometry};
use crate::mac::MacTable;
use crate::types::{
    BridgeDomainInfo, DomainAction, DomainActions, DomainKind, DomainSel, StatsIndexPool,
};
use crate::{L2BridgeError, L2brResult};
use byteorder::{ByteOrder, NetworkEndian};
use pfe_dmem::Dmem;
use pfe_types::{IfaceBitmap, InterfaceId, MacAddress, VlanId};
use tracing::{debug, info, warn};

/// VLAN-table key reserved for the fall-back domain.
///
/// VLAN 0 is not a valid `VlanId`, so the key never collides with a
/// standard domain.
const FALLBACK_KEY: u16 = 0;

/// One record of the hardware VLAN table.
#[derive(Debug, Clone)]
pub(crate) struct VlanEntry {
    pub(crate) vlan: u16,
    pub(crate) forward: IfaceBitmap,
    pub(crate) untag: IfaceBitmap,
    pub(crate) actions: DomainActions,
    pub(crate) stats_index: u8,
}

impl SlotEntry for VlanEntry {
    type Key = u16;
    const PAYLOAD_SIZE: usize = 12;

    fn key(&self) -> u16 {
        self.vlan
    }

    fn slot_index(key: &u16, hash_slots: usize) -> usize {
        // Hardware hashes on the low bits of the VLAN id.
        (*key as usize) & (hash_slots - 1)
    }

    fn encode(&self, buf: &mut [u8]) {
        NetworkEndian::write_u16(&mut buf[0..2], self.vlan);
        NetworkEndian::write_u32(&mut buf[2..6], self.forward.as_u32());
        NetworkEndian::write_u32(&mut buf[6..10], self.untag.as_u32());
        buf[10] = self.actions.pack();
        buf[11] = self.stats_index;
    }
}

struct BridgeDomain {
    kind: DomainKind,
    vlan: Option<VlanId>,
    forward: IfaceBitmap,
    untag: IfaceBitmap,
    actions: DomainActions,
    stats_index: u8,
    members: Vec<(InterfaceId, bool)>,
}

impl BridgeDomain {
    fn vlan_entry(&self, key: u16) -> VlanEntry {
        VlanEntry {
            vlan: key,
            forward: self.forward,
            untag: self.untag,
            actions: self.actions,
            stats_index: self.stats_index,
        }
    }

    fn snapshot(&self) -> BridgeDomainInfo {
        BridgeDomainInfo {
            vlan: self.vlan,
            kind: self.kind,
            forward: self.forward,
            untag: self.untag,
            actions: self.actions,
            stats_index: self.stats_index,
            members: self.members.clone(),
        }
    }
}

/// Bridge construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    /// VLAN of the default domain.
    pub default_vlan: VlanId,
    /// VLAN table geometry.
    pub vlan_geometry: TableGeometry,
    /// MAC table geometry.
    pub mac_geometry: TableGeometry,
    /// Number of per-domain statistics indices (including the shared slot).
    pub stats_pool_size: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_vlan: VlanId::DEFAULT,
            // 64 primary slots: the hardware hash is the low 6 VLAN bits.
            vlan_geometry: TableGeometry {
                hash_slots: 64,
                collision_slots: 32,
            },
            mac_geometry: TableGeometry {
                hash_slots: 64,
                collision_slots: 64,
            },
            stats_pool_size: 32,
        }
    }
}

/// Caller-owned cursor over the bridge's domains.
#[derive(Debug, Clone, Default)]
pub struct DomainCursor {
    next_index: usize,
    last: Option<u16>,
}

impl DomainCursor {
    /// Creates a cursor positioned before the first domain.
    pub fn start() -> Self {
        Self::default()
    }
}

/// An L2 bridge instance.
///
/// All methods take the DMEM handle explicitly: the platform owns the
/// memory window and shares it between the bridge and the classifier.
/// Access is serialized by `&mut self`.
pub struct L2Bridge {
    domains: std::collections::HashMap<u16, BridgeDomain>,
    domain_order: Vec<u16>,
    vlan_table: HashTable<VlanEntry>,
    stats_pool: StatsIndexPool,
    mac: MacTable,
    default_vlan: VlanId,
}

impl L2Bridge {
    /// Brings up a bridge: allocates both hardware tables and creates the
    /// default and fall-back domains.
    pub fn new(dmem: &mut dyn Dmem, config: BridgeConfig) -> L2brResult<Self> {
        let vlan_table = HashTable::new(dmem, config.vlan_geometry)?;
        let mac = MacTable::new(dmem, config.mac_geometry)?;

        let mut bridge = Self {
            domains: std::collections::HashMap::new(),
            domain_order: Vec::new(),
            vlan_table,
            stats_pool: StatsIndexPool::new(config.stats_pool_size),
            mac,
            default_vlan: config.default_vlan,
        };

        bridge.create_domain(dmem, DomainKind::FallBack, None)?;
        bridge.create_domain(dmem, DomainKind::Default, Some(config.default_vlan))?;
        info!(default_vlan = %config.default_vlan, "bridge instance up");
        Ok(bridge)
    }

    fn key_of(sel: DomainSel) -> u16 {
        match sel {
            DomainSel::FallBack => FALLBACK_KEY,
            DomainSel::Vlan(vlan) => vlan.as_u16(),
        }
    }

    fn domain(&self, sel: DomainSel) -> L2brResult<&BridgeDomain> {
        self.domains
            .get(&Self::key_of(sel))
            .ok_or_else(|| L2BridgeError::not_found(sel.to_string()))
    }

    fn create_domain(
        &mut self,
        dmem: &mut dyn Dmem,
        kind: DomainKind,
        vlan: Option<VlanId>,
    ) -> L2brResult<()> {
        let key = vlan.map(|v| v.as_u16()).unwrap_or(FALLBACK_KEY);
        if self.domains.contains_key(&key) {
            return Err(L2BridgeError::already_exists(format!("domain {}", key)));
        }

        let stats_index = self.stats_pool.alloc();
        let domain = BridgeDomain {
            kind,
            vlan,
            forward: IfaceBitmap::EMPTY,
            untag: IfaceBitmap::EMPTY,
            actions: DomainActions::DISCARD_ALL,
            stats_index,
            members: Vec::new(),
        };

        // The domain only becomes visible once the all-discard entry is
        // in the hardware table.
        if let Err(err) = self.vlan_table.add(dmem, domain.vlan_entry(key)) {
            self.stats_pool.release(stats_index);
            return Err(err);
        }

        debug!(domain = key, ?kind, stats_index, "domain created");
        self.domain_order.push(key);
        self.domains.insert(key, domain);
        Ok(())
    }

    /// Creates a standard domain for `vlan`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the VLAN already has a domain; hash-table
    /// errors (collision region exhaustion, hardware faults) propagate.
    pub fn domain_create(&mut self, dmem: &mut dyn Dmem, vlan: VlanId) -> L2brResult<()> {
        self.create_domain(dmem, DomainKind::Standard, Some(vlan))
    }

    /// Destroys the standard domain of `vlan`.
    ///
    /// The default and fall-back domains live as long as the bridge; they
    /// are only torn down by [`L2Bridge::shutdown`].
    pub fn domain_destroy(&mut self, dmem: &mut dyn Dmem, vlan: VlanId) -> L2brResult<()> {
        let key = vlan.as_u16();
        let domain = self
            .domains
            .get(&key)
            .ok_or_else(|| L2BridgeError::not_found(format!("domain {}", vlan)))?;
        if domain.kind != DomainKind::Standard {
            return Err(L2BridgeError::invalid_argument(
                "default and fall-back domains are destroyed with the bridge",
            ));
        }
        self.destroy_domain(dmem, key)
    }

    fn destroy_domain(&mut self, dmem: &mut dyn Dmem, key: u16) -> L2brResult<()> {
        let domain = self
            .domains
            .get(&key)
            .ok_or_else(|| L2BridgeError::not_found(format!("domain {}", key)))?;

        // The fall-back domain keeps matching traffic until the very
        // moment it disappears: force everything to discard first, and
        // abort the destroy if hardware refuses.
        if domain.kind == DomainKind::FallBack {
            let mut entry = domain.vlan_entry(key);
            entry.actions = DomainActions::DISCARD_ALL;
            self.vlan_table.update(dmem, entry)?;
        }

        if !domain.members.is_empty() {
            warn!(
                domain = key,
                members = domain.members.len(),
                "destroying domain with live interface members"
            );
        }

        self.vlan_table.delete(dmem, &key)?;
        if let Some(domain) = self.domains.remove(&key) {
            self.stats_pool.release(domain.stats_index);
        }
        self.domain_order.retain(|k| *k != key);
        debug!(domain = key, "domain destroyed");
        Ok(())
    }

    /// Tears the bridge down: destroys every domain (fall-back last) and
    /// releases both hardware tables.
    pub fn shutdown(&mut self, dmem: &mut dyn Dmem) -> L2brResult<()> {
        let keys: Vec<u16> = self
            .domain_order
            .iter()
            .copied()
            .filter(|k| *k != FALLBACK_KEY)
            .collect();
        for key in keys {
            self.destroy_domain(dmem, key)?;
        }
        if self.domains.contains_key(&FALLBACK_KEY) {
            self.destroy_domain(dmem, FALLBACK_KEY)?;
        }
        self.mac.flush_all(dmem)?;
        self.mac.release(dmem)?;
        self.vlan_table.release(dmem)?;
        info!("bridge instance down");
        Ok(())
    }

    /// Adds an interface to a domain's forward list (and untag list when
    /// `tagged` is false).
    ///
    /// Hardware is written first; on failure no membership is recorded.
    pub fn domain_add_if(
        &mut self,
        dmem: &mut dyn Dmem,
        sel: DomainSel,
        iface: InterfaceId,
        tagged: bool,
    ) -> L2brResult<()> {
        let key = Self::key_of(sel);
        let domain = self.domain(sel)?;
        if domain.members.iter().any(|(member, _)| *member == iface) {
            return Err(L2BridgeError::already_exists(format!(
                "{} in {}",
                iface, sel
            )));
        }

        let mut entry = domain.vlan_entry(key);
        entry.forward.set(iface);
        if !tagged {
            entry.untag.set(iface);
        }
        self.vlan_table.update(dmem, entry)?;

        let domain = self
            .domains
            .get_mut(&key)
            .ok_or_else(|| L2BridgeError::not_found(sel.to_string()))?;
        domain.forward.set(iface);
        if !tagged {
            domain.untag.set(iface);
        }
        domain.members.push((iface, tagged));
        debug!(domain = key, %iface, tagged, "interface added");
        Ok(())
    }

    /// Removes an interface from a domain.
    ///
    /// The bitmap change is propagated before the membership record is
    /// dropped; a rejected write restores the previous bitmaps.
    pub fn domain_del_if(
        &mut self,
        dmem: &mut dyn Dmem,
        sel: DomainSel,
        iface: InterfaceId,
    ) -> L2brResult<()> {
        let key = Self::key_of(sel);
        let domain = self.domain(sel)?;
        if !domain.members.iter().any(|(member, _)| *member == iface) {
            return Err(L2BridgeError::not_found(format!("{} in {}", iface, sel)));
        }

        let mut entry = domain.vlan_entry(key);
        entry.forward.clear(iface);
        entry.untag.clear(iface);
        self.vlan_table.update(dmem, entry)?;

        let domain = self
            .domains
            .get_mut(&key)
            .ok_or_else(|| L2BridgeError::not_found(sel.to_string()))?;
        domain.forward.clear(iface);
        domain.untag.clear(iface);
        domain.members.retain(|(member, _)| *member != iface);
        debug!(domain = key, %iface, "interface removed");
        Ok(())
    }

    fn set_actions(
        &mut self,
        dmem: &mut dyn Dmem,
        sel: DomainSel,
        apply: impl FnOnce(&mut DomainActions),
    ) -> L2brResult<()> {
        let key = Self::key_of(sel);
        let domain = self.domain(sel)?;

        let mut actions = domain.actions;
        apply(&mut actions);

        // The hardware keeps one action word; rewrite it wholesale.
        let mut entry = domain.vlan_entry(key);
        entry.actions = actions;
        self.vlan_table.update(dmem, entry)?;

        if let Some(domain) = self.domains.get_mut(&key) {
            domain.actions = actions;
        }
        Ok(())
    }

    /// Sets the unicast hit/miss actions.
    pub fn domain_set_ucast_action(
        &mut self,
        dmem: &mut dyn Dmem,
        sel: DomainSel,
        hit: DomainAction,
        miss: DomainAction,
    ) -> L2brResult<()> {
        self.set_actions(dmem, sel, |actions| {
            actions.ucast_hit = hit;
            actions.ucast_miss = miss;
        })
    }

    /// Sets the multicast hit/miss actions.
    pub fn domain_set_mcast_action(
        &mut self,
        dmem: &mut dyn Dmem,
        sel: DomainSel,
        hit: DomainAction,
        miss: DomainAction,
    ) -> L2brResult<()> {
        self.set_actions(dmem, sel, |actions| {
            actions.mcast_hit = hit;
            actions.mcast_miss = miss;
        })
    }

    /// Removes every MAC entry (static and learned) of the domain's VLAN
    /// whose forward list contains `iface`. Returns the number removed.
    pub fn domain_flush_by_if(
        &mut self,
        dmem: &mut dyn Dmem,
        sel: DomainSel,
        iface: InterfaceId,
    ) -> L2brResult<usize> {
        let domain = self.domain(sel)?;
        let vlan = domain.vlan.ok_or_else(|| {
            L2BridgeError::invalid_argument("fall-back domain has no MAC entries to flush")
        })?;
        self.mac.flush_domain_if(dmem, vlan, iface)
    }

    /// Returns a snapshot of a domain.
    pub fn domain_info(&self, sel: DomainSel) -> L2brResult<BridgeDomainInfo> {
        self.domain(sel).map(BridgeDomain::snapshot)
    }

    /// Number of domains, including default and fall-back.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// The default domain's VLAN.
    pub fn default_vlan(&self) -> VlanId {
        self.default_vlan
    }

    /// Advances a domain cursor, returning the next domain snapshot.
    ///
    /// The cursor tolerates domain destroys between calls by re-syncing
    /// on the last returned key.
    pub fn next_domain(&self, cursor: &mut DomainCursor) -> Option<BridgeDomainInfo> {
        let index = match cursor.last {
            None => 0,
            Some(last) => match self.domain_order.iter().position(|k| *k == last) {
                Some(pos) => pos + 1,
                None => cursor.next_index.saturating_sub(1),
            },
        };
        let key = *self.domain_order.get(index)?;
        let info = self.domains.get(&key).map(BridgeDomain::snapshot)?;
        cursor.last = Some(key);
        cursor.next_index = index + 1;
        Some(info)
    }

    // MAC table surface: the static-entry manager is part of the bridge.

    /// Creates a statically pinned MAC entry. See [`MacTable`] for the
    /// duplicate-check contract.
    pub fn static_entry_create(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        forward: IfaceBitmap,
    ) -> L2brResult<()> {
        self.mac.static_entry_create(dmem, vlan, mac, forward)
    }

    /// Destroys a static MAC entry.
    pub fn static_entry_destroy(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
    ) -> L2brResult<()> {
        self.mac.static_entry_destroy(dmem, vlan, mac)
    }

    /// Records a dynamically learned MAC on `iface`.
    pub fn learn(
        &mut self,
        dmem: &mut dyn Dmem,
        vlan: VlanId,
        mac: MacAddress,
        iface: InterfaceId,
    ) -> L2brResult<()> {
        self.mac.learn(dmem, vlan, mac, iface)
    }

    /// Removes every learned entry.
    pub fn flush_learned(&mut self, dmem: &mut dyn Dmem) -> L2brResult<usize> {
        self.mac.flush_learned(dmem)
    }

    /// Removes every static entry.
    pub fn flush_static(&mut self, dmem: &mut dyn Dmem) -> L2brResult<usize> {
        self.mac.flush_static(dmem)
    }

    /// Removes everything and re-initializes the MAC table.
    pub fn flush_all(&mut self, dmem: &mut dyn Dmem) -> L2brResult<usize> {
        self.mac.flush_all(dmem)
    }

    /// Read access to the MAC table manager.
    pub fn mac_table(&self) -> &MacTable {
        &self.mac
    }

    /// Write access to the MAC table manager.
    pub fn mac_table_mut(&mut self) -> &mut MacTable {
        &mut self.mac
    }

    #[cfg(test)]
    pub(crate) fn vlan_chain(&self, key: u16) -> Vec<usize> {
        self.vlan_table.chain_of(&key)
    }

    #[cfg(test)]
    pub(crate) fn vlan_slot(&self, key: u16) -> Option<usize> {
        self.vlan_table.slot_of(&key)
    }
}
