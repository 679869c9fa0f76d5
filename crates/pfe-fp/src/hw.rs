//! Table serialization into PE data memory.
//!
//! A pushed table is a header followed by a flat rule array. Rule chaining
//! is expressed to firmware as array indices, so every symbolic
//! `next_rule` name is resolved to the rule's ordinal inside this table
//! before anything touches hardware. The whole image is assembled in a
//! host buffer and handed over with a single write, so a failed push never
//! leaves a partially written table behind.
//!
//! Layout (network byte order):
//!
//! ```text
//! header:  [rule_count: u32][rules_addr: u32]
//! rule:    [data: u32][mask: u32][offset: u16][flags: u16]
//!          [next_idx: u16][reserved: u16]
//! ```

use crate::db::FpDb;
use crate::{FpError, FpResult};
use byteorder::{ByteOrder, NetworkEndian};
use pfe_dmem::{Dmem, DmemAddr, DmemError};
use tracing::{debug, warn};

/// Size of the table header in bytes.
pub const TABLE_HEADER_SIZE: usize = 8;

/// Size of one serialized rule record in bytes.
pub const RULE_RECORD_SIZE: usize = 16;

/// Chain terminator: the rule has no next rule.
pub const NO_NEXT_RULE: u16 = 0xffff;

struct ResolvedRule {
    data: u32,
    mask: u32,
    offset: u16,
    flags: u16,
    next_idx: u16,
}

/// Resolves every member rule of `table` against the table's own order.
///
/// The position lookup is per-rule linear scan, bounded by the table
/// length; tables are short chains, never the global rule set.
fn resolve_table(db: &FpDb, table_name: &str) -> FpResult<Vec<ResolvedRule>> {
    let table = db.table(table_name)?;
    let mut resolved = Vec::with_capacity(table.rules.len());

    for member in &table.rules {
        let rule = db.rule(member)?;
        let next_idx = match (&rule.next_rule, rule.flags.is_terminal()) {
            (_, true) | (None, _) => NO_NEXT_RULE,
            (Some(next), false) => {
                let pos = db.rule_position(table_name, next).ok_or_else(|| {
                    warn!(table = %table_name, rule = %member, next = %next,
                        "next rule is not a member of the table");
                    FpError::not_found(next)
                })?;
                pos as u16
            }
        };
        resolved.push(ResolvedRule {
            data: rule.data,
            mask: rule.mask,
            offset: rule.offset,
            flags: rule.flags.as_u16(),
            next_idx,
        });
    }
    Ok(resolved)
}

fn build_image(addr: DmemAddr, rules: &[ResolvedRule]) -> Vec<u8> {
    let mut image = vec![0u8; TABLE_HEADER_SIZE + rules.len() * RULE_RECORD_SIZE];

    NetworkEndian::write_u32(&mut image[0..4], rules.len() as u32);
    NetworkEndian::write_u32(
        &mut image[4..8],
        addr.as_u32() + TABLE_HEADER_SIZE as u32,
    );

    for (i, rule) in rules.iter().enumerate() {
        let rec = &mut image[TABLE_HEADER_SIZE + i * RULE_RECORD_SIZE..];
        NetworkEndian::write_u32(&mut rec[0..4], rule.data);
        NetworkEndian::write_u32(&mut rec[4..8], rule.mask);
        NetworkEndian::write_u16(&mut rec[8..10], rule.offset);
        NetworkEndian::write_u16(&mut rec[10..12], rule.flags);
        NetworkEndian::write_u16(&mut rec[12..14], rule.next_idx);
        // rec[14..16] reserved, stays zero
    }
    image
}

/// Serializes a table into DMEM and records the resulting address.
///
/// # Errors
///
/// `NotFound` when the table is unknown or a member's next-rule name does
/// not resolve within the table; `Busy` when the table is already pushed;
/// `OutOfMemory` when DMEM cannot hold the image. Any failure leaves the
/// table's address NULL and DMEM without the new allocation.
pub fn push_table(db: &mut FpDb, dmem: &mut dyn Dmem, table_name: &str) -> FpResult<DmemAddr> {
    if !db.table_dmem_addr(table_name).is_null() {
        return Err(FpError::busy(table_name, "already pushed to hardware"));
    }

    // Resolve before allocating: a dangling next-rule reference must not
    // leave any hardware side effects.
    let resolved = resolve_table(db, table_name)?;

    let size = TABLE_HEADER_SIZE + resolved.len() * RULE_RECORD_SIZE;
    let addr = dmem.alloc(size).map_err(|err| match err {
        DmemError::OutOfMemory { .. } => FpError::OutOfMemory,
        other => FpError::Hardware(other),
    })?;

    let image = build_image(addr, &resolved);
    if let Err(err) = dmem.write(addr, &image) {
        dmem.free(addr)?;
        return Err(FpError::Hardware(err));
    }

    db.table_mut(table_name)?.dmem_addr = addr;
    debug!(table = %table_name, %addr, rules = resolved.len(), "table pushed to DMEM");
    Ok(addr)
}

/// Releases a table's DMEM image and clears its address.
///
/// The caller must have detached the table from every interface and filter
/// slot first; firmware still holding the address would chase freed
/// memory.
pub fn pop_table(db: &mut FpDb, dmem: &mut dyn Dmem, table_name: &str) -> FpResult<()> {
    let addr = {
        let table = db.table(table_name)?;
        table.dmem_addr
    };
    if addr.is_null() {
        warn!(table = %table_name, "pop of a table that is not in hardware");
        return Ok(());
    }

    dmem.free(addr)?;
    db.table_mut(table_name)?.dmem_addr = DmemAddr::NULL;
    debug!(table = %table_name, %addr, "table popped from DMEM");
    Ok(())
}
