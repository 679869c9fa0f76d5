//! Hash-indexed DMEM table with explicit collision chains.
//!
//! The hardware lookup structure is a fixed array of hash slots followed
//! by a reserved collision region. An entry lives in its primary slot
//! (`hash(key)`) when that slot is free; otherwise it goes to the first
//! free collision slot and the chain tail's link field points at it. The
//! host keeps a full shadow of the table and mirrors every slot mutation
//! into DMEM, one fixed-size record per slot.
//!
//! Record layout (network byte order):
//!
//! ```text
//! [valid: u8][reserved: u8][next: u16][payload: E::PAYLOAD_SIZE bytes]
//! ```
//!
//! `next` holds the absolute slot index of the chain continuation, or
//! [`SLOT_LINK_NONE`].
//!
//! Multi-slot mutations stage their slot writes, push them to DMEM in
//! order, and only then commit the shadow; a rejected write restores the
//! already-written records so hardware keeps the previous valid table.

use crate::{L2BridgeError, L2brResult};
use byteorder::{ByteOrder, NetworkEndian};
use pfe_dmem::{Dmem, DmemAddr};
use tracing::{debug, warn};

/// Link value meaning "end of chain".
pub const SLOT_LINK_NONE: u16 = 0xffff;

const SLOT_HEADER_SIZE: usize = 4;

/// An entry storable in a [`HashTable`].
pub(crate) trait SlotEntry: Clone {
    /// Lookup key identifying the entry within the table.
    type Key: Copy + PartialEq + std::fmt::Debug;

    /// Encoded payload size in bytes.
    const PAYLOAD_SIZE: usize;

    /// Returns the entry's key.
    fn key(&self) -> Self::Key;

    /// Maps a key onto a primary slot index in `0..hash_slots`.
    fn slot_index(key: &Self::Key, hash_slots: usize) -> usize;

    /// Encodes the payload into `buf` (`PAYLOAD_SIZE` bytes).
    fn encode(&self, buf: &mut [u8]);
}

/// Table geometry: primary hash slots plus a collision region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableGeometry {
    /// Number of primary slots; must be a power of two.
    pub hash_slots: usize,
    /// Number of reserved collision slots.
    pub collision_slots: usize,
}

impl TableGeometry {
    fn validate(&self) -> L2brResult<()> {
        if self.hash_slots == 0 || !self.hash_slots.is_power_of_two() {
            return Err(L2BridgeError::invalid_argument(
                "hash slot count must be a non-zero power of two",
            ));
        }
        Ok(())
    }

    fn total(&self) -> usize {
        self.hash_slots + self.collision_slots
    }
}

#[derive(Debug, Clone)]
struct Slot<E> {
    entry: E,
    next: Option<usize>,
}

pub(crate) struct HashTable<E: SlotEntry> {
    geometry: TableGeometry,
    base: DmemAddr,
    slots: Vec<Option<Slot<E>>>,
}

impl<E: SlotEntry> HashTable<E> {
    const RECORD_SIZE: usize = SLOT_HEADER_SIZE + E::PAYLOAD_SIZE;

    /// Allocates and zero-initializes the table region in DMEM.
    pub(crate) fn new(dmem: &mut dyn Dmem, geometry: TableGeometry) -> L2brResult<Self> {
        geometry.validate()?;
        let size = geometry.total() * Self::RECORD_SIZE;
        let base = dmem.alloc(size)?;
        dmem.write(base, &vec![0u8; size])?;
        debug!(%base, slots = geometry.total(), "hash table region allocated");
        Ok(Self {
            geometry,
            base,
            slots: vec![None; geometry.total()],
        })
    }

    /// DMEM address of the table region.
    #[cfg(test)]
    pub(crate) fn base(&self) -> DmemAddr {
        self.base
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn slot_addr(&self, index: usize) -> DmemAddr {
        DmemAddr::from_raw(self.base.as_u32() + (index * Self::RECORD_SIZE) as u32)
    }

    fn encode_record(state: &Option<Slot<E>>) -> Vec<u8> {
        let mut record = vec![0u8; Self::RECORD_SIZE];
        if let Some(slot) = state {
            record[0] = 1;
            let next = slot.next.map(|n| n as u16).unwrap_or(SLOT_LINK_NONE);
            NetworkEndian::write_u16(&mut record[2..4], next);
            slot.entry.encode(&mut record[SLOT_HEADER_SIZE..]);
        } else {
            NetworkEndian::write_u16(&mut record[2..4], SLOT_LINK_NONE);
        }
        record
    }

    /// Pushes staged slot states to DMEM, then commits them to the shadow.
    ///
    /// On a rejected write the already-written records are restored from
    /// the shadow, which still holds the previous valid state.
    fn apply(
        &mut self,
        dmem: &mut dyn Dmem,
        staged: Vec<(usize, Option<Slot<E>>)>,
    ) -> L2brResult<()> {
        for (written, (index, state)) in staged.iter().enumerate() {
            if let Err(err) = dmem.write(self.slot_addr(*index), &Self::encode_record(state)) {
                for (index, _) in &staged[..written] {
                    let old = Self::encode_record(&self.slots[*index]);
                    if dmem.write(self.slot_addr(*index), &old).is_err() {
                        warn!(slot = index, "failed to restore slot after write fault");
                    }
                }
                return Err(L2BridgeError::Hardware(err));
            }
        }
        for (index, state) in staged {
            self.slots[index] = state;
        }
        Ok(())
    }

    /// Walks the chain rooted at the key's primary slot.
    ///
    /// Returns the visited slot indices in chain order; an empty result
    /// means the primary slot is free.
    fn chain(&self, key: &E::Key) -> Vec<usize> {
        let primary = E::slot_index(key, self.geometry.hash_slots);
        let mut indices = Vec::new();
        let mut cursor = match self.slots[primary] {
            Some(_) => Some(primary),
            None => None,
        };
        while let Some(index) = cursor {
            indices.push(index);
            cursor = self.slots[index].as_ref().and_then(|s| s.next);
        }
        indices
    }

    fn find(&self, key: &E::Key) -> Option<usize> {
        self.chain(key)
            .into_iter()
            .find(|&i| self.slots[i].as_ref().map(|s| s.entry.key()) == Some(*key))
    }

    /// Returns true if the key is present.
    pub(crate) fn contains(&self, key: &E::Key) -> bool {
        self.find(key).is_some()
    }

    /// Returns the entry for `key`, if present.
    pub(crate) fn get(&self, key: &E::Key) -> Option<&E> {
        self.find(key).and_then(|i| self.slots[i].as_ref()).map(|s| &s.entry)
    }

    /// Inserts a new entry.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the key is present anywhere in its chain;
    /// `OutOfMemory` when the collision region is exhausted.
    pub(crate) fn add(&mut self, dmem: &mut dyn Dmem, entry: E) -> L2brResult<()> {
        let key = entry.key();
        if self.contains(&key) {
            return Err(L2BridgeError::already_exists(format!("{:?}", key)));
        }

        let primary = E::slot_index(&key, self.geometry.hash_slots);
        let staged = if self.slots[primary].is_none() {
            vec![(primary, Some(Slot { entry, next: None }))]
        } else {
            // Primary taken by a different key: first-fit scan of the
            // collision region, then link from the chain tail.
            let free = (self.geometry.hash_slots..self.geometry.total())
                .find(|&i| self.slots[i].is_none())
                .ok_or_else(|| L2BridgeError::out_of_memory("collision region"))?;
            let tail = *self
                .chain(&key)
                .last()
                .ok_or_else(|| L2BridgeError::invalid_argument("empty chain on occupied slot"))?;
            let tail_slot = self.slots[tail]
                .as_ref()
                .ok_or_else(|| L2BridgeError::invalid_argument("dangling chain link"))?;
            vec![
                (free, Some(Slot { entry, next: None })),
                (
                    tail,
                    Some(Slot {
                        entry: tail_slot.entry.clone(),
                        next: Some(free),
                    }),
                ),
            ]
        };
        self.apply(dmem, staged)
    }

    /// Overwrites the entry for `key` in place.
    ///
    /// # Errors
    ///
    /// `NotFound` when the key is absent (signaled distinctly so callers
    /// can tell a missing entry from a hardware fault).
    pub(crate) fn update(&mut self, dmem: &mut dyn Dmem, entry: E) -> L2brResult<()> {
        let key = entry.key();
        let index = self
            .find(&key)
            .ok_or_else(|| L2BridgeError::not_found(format!("{:?}", key)))?;
        let next = self.slots[index].as_ref().and_then(|s| s.next);
        self.apply(dmem, vec![(index, Some(Slot { entry, next }))])
    }

    /// Removes the entry for `key`, repairing its chain.
    ///
    /// Deleting a chain head promotes its successor into the primary slot;
    /// deleting a middle or tail entry patches the predecessor's link.
    pub(crate) fn delete(&mut self, dmem: &mut dyn Dmem, key: &E::Key) -> L2brResult<()> {
        let chain = self.chain(key);
        let pos = chain
            .iter()
            .position(|&i| self.slots[i].as_ref().map(|s| s.entry.key()) == Some(*key))
            .ok_or_else(|| L2BridgeError::not_found(format!("{:?}", key)))?;
        let index = chain[pos];
        let victim_next = self.slots[index].as_ref().and_then(|s| s.next);

        let staged = if pos == 0 {
            match victim_next {
                // Head with a successor: promote the successor's payload
                // into the primary slot and release its collision slot.
                Some(succ) => {
                    let succ_slot = self.slots[succ]
                        .as_ref()
                        .ok_or_else(|| L2BridgeError::invalid_argument("dangling chain link"))?;
                    vec![
                        (
                            index,
                            Some(Slot {
                                entry: succ_slot.entry.clone(),
                                next: succ_slot.next,
                            }),
                        ),
                        (succ, None),
                    ]
                }
                None => vec![(index, None)],
            }
        } else {
            let pred = chain[pos - 1];
            let pred_slot = self.slots[pred]
                .as_ref()
                .ok_or_else(|| L2BridgeError::invalid_argument("dangling chain link"))?;
            vec![
                (
                    pred,
                    Some(Slot {
                        entry: pred_slot.entry.clone(),
                        next: victim_next,
                    }),
                ),
                (index, None),
            ]
        };
        self.apply(dmem, staged)
    }

    /// Returns the keys of every entry matching the predicate.
    pub(crate) fn keys_where(&self, pred: impl Fn(&E) -> bool) -> Vec<E::Key> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| pred(&s.entry))
            .map(|s| s.entry.key())
            .collect()
    }

    /// Clears the whole table, rewriting every DMEM record empty.
    ///
    /// Used instead of the hardware flush opcode, which hangs the engine.
    pub(crate) fn reset(&mut self, dmem: &mut dyn Dmem) -> L2brResult<()> {
        let mut image = Vec::with_capacity(self.geometry.total() * Self::RECORD_SIZE);
        for _ in 0..self.geometry.total() {
            image.extend_from_slice(&Self::encode_record(&None));
        }
        dmem.write(self.base, &image)?;
        self.slots.iter_mut().for_each(|s| *s = None);
        Ok(())
    }

    /// Releases the table region. The table is unusable afterwards.
    pub(crate) fn release(&mut self, dmem: &mut dyn Dmem) -> L2brResult<()> {
        if !self.base.is_null() {
            dmem.free(self.base)?;
            self.base = DmemAddr::NULL;
        }
        Ok(())
    }

    /// Slot index occupied by `key`, for diagnostics and tests.
    #[cfg(test)]
    pub(crate) fn slot_of(&self, key: &E::Key) -> Option<usize> {
        self.find(key)
    }

    /// Chain indices rooted at `key`'s primary slot, for tests.
    #[cfg(test)]
    pub(crate) fn chain_of(&self, key: &E::Key) -> Vec<usize> {
        self.chain(key)
    }
}
