//! Flexible Parser rule and table database.
//!
//! The database owns every rule and table by name; a table holds an ordered
//! chain of member rule names, and each rule carries a back-reference to
//! the table it is attached to (the "in use" marker). Rules and tables are
//! kept in separate collections with stable insertion order, so wire-level
//! first/next queries enumerate entities in creation order.
//!
//! The database is an explicit context object: the platform creates one
//! instance per engine and serializes access to it (all mutators take
//! `&mut self`). Query cursors are owned by the caller and tolerate
//! destroys between `first` and `next` by re-syncing on the last returned
//! name.

use crate::types::{FpRuleInfo, FpRuleSpec, RuleFlags, TablePosition};
use crate::{FpError, FpResult};
use pfe_dmem::DmemAddr;
use std::collections::HashMap;
use tracing::{debug, warn};

pub(crate) struct FpRule {
    pub(crate) name: String,
    pub(crate) data: u32,
    pub(crate) mask: u32,
    pub(crate) offset: u16,
    pub(crate) flags: RuleFlags,
    pub(crate) next_rule: Option<String>,
    /// Table this rule is attached to; used only to detect "in use".
    pub(crate) table: Option<String>,
}

impl FpRule {
    fn snapshot(&self) -> FpRuleInfo {
        FpRuleInfo {
            name: self.name.clone(),
            data: self.data,
            mask: self.mask,
            offset: self.offset,
            flags: self.flags,
            next_rule: self.next_rule.clone(),
            table: self.table.clone(),
        }
    }
}

pub(crate) struct FpTable {
    pub(crate) name: String,
    /// Ordered member rule names; order is the hardware evaluation order.
    pub(crate) rules: Vec<String>,
    /// DMEM address once pushed; NULL while host-only.
    pub(crate) dmem_addr: DmemAddr,
}

/// Caller-owned cursor over the global rule list.
///
/// A destroy between two `next` calls skips the removed element: the
/// cursor remembers the last returned name and falls back to the
/// remembered index when that name is gone.
#[derive(Debug, Clone, Default)]
pub struct RuleCursor {
    next_index: usize,
    last: Option<String>,
}

impl RuleCursor {
    /// Creates a cursor positioned before the first rule.
    pub fn start() -> Self {
        Self::default()
    }
}

/// Caller-owned cursor over one table's rule chain.
#[derive(Debug, Clone)]
pub struct TableRuleCursor {
    table: String,
    next_index: usize,
    last: Option<String>,
}

impl TableRuleCursor {
    /// Creates a cursor positioned before the first rule of `table`.
    pub fn start(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            next_index: 0,
            last: None,
        }
    }

    /// The table this cursor iterates.
    pub fn table(&self) -> &str {
        &self.table
    }
}

/// The Flexible Parser rule/table database.
///
/// # Examples
///
/// ```
/// use pfe_fp::{FpDb, FpRuleSpec, RuleFlags, TablePosition};
///
/// let mut db = FpDb::new();
/// db.create_rule(FpRuleSpec {
///     name: "ipv4".into(),
///     data: 0x0800,
///     mask: 0xffff,
///     offset: 12,
///     flags: RuleFlags::ACCEPT,
///     next_rule: None,
/// })
/// .unwrap();
///
/// db.create_table("ingress").unwrap();
/// db.add_rule_to_table("ingress", "ipv4", TablePosition::Last).unwrap();
/// assert_eq!(db.table_rule_count("ingress").unwrap(), 1);
/// ```
#[derive(Default)]
pub struct FpDb {
    rules: HashMap<String, FpRule>,
    rule_order: Vec<String>,
    tables: HashMap<String, FpTable>,
    table_order: Vec<String>,
}

impl FpDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a rule at the tail of the global list.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the flag set is contradictory (both ACCEPT
    /// and REJECT, or neither and no next rule), `AlreadyExists` when the
    /// name is taken.
    pub fn create_rule(&mut self, spec: FpRuleSpec) -> FpResult<()> {
        spec.flags.validate(spec.next_rule.is_some())?;
        if spec.name.is_empty() {
            return Err(FpError::invalid_argument("empty rule name"));
        }
        if self.rules.contains_key(&spec.name) {
            return Err(FpError::already_exists(&spec.name));
        }

        debug!(rule = %spec.name, "creating FP rule");
        self.rule_order.push(spec.name.clone());
        self.rules.insert(
            spec.name.clone(),
            FpRule {
                name: spec.name,
                data: spec.data,
                mask: spec.mask,
                offset: spec.offset,
                flags: spec.flags,
                next_rule: spec.next_rule,
                table: None,
            },
        );
        Ok(())
    }

    /// Destroys a rule that is not attached to any table.
    pub fn destroy_rule(&mut self, name: &str) -> FpResult<()> {
        let rule = self.rules.get(name).ok_or_else(|| FpError::not_found(name))?;
        if let Some(table) = &rule.table {
            return Err(FpError::busy(name, format!("member of table {}", table)));
        }

        debug!(rule = %name, "destroying FP rule");
        self.rules.remove(name);
        self.rule_order.retain(|n| n != name);
        Ok(())
    }

    /// Creates an empty table at the tail of the global table list.
    pub fn create_table(&mut self, name: &str) -> FpResult<()> {
        if name.is_empty() {
            return Err(FpError::invalid_argument("empty table name"));
        }
        if self.tables.contains_key(name) {
            return Err(FpError::already_exists(name));
        }

        debug!(table = %name, "creating FP table");
        self.table_order.push(name.to_string());
        self.tables.insert(
            name.to_string(),
            FpTable {
                name: name.to_string(),
                rules: Vec::new(),
                dmem_addr: DmemAddr::NULL,
            },
        );
        Ok(())
    }

    /// Destroys a table, unlinking every member rule.
    ///
    /// A table that is pushed to hardware (non-NULL address) refuses to die
    /// unless `force` is set. Forcing only clears the host-side address:
    /// the caller must already have torn down the hardware copy, otherwise
    /// firmware keeps chasing a stale pointer.
    pub fn destroy_table(&mut self, name: &str, force: bool) -> FpResult<()> {
        let table = self.tables.get(name).ok_or_else(|| FpError::not_found(name))?;
        if !table.dmem_addr.is_null() {
            if !force {
                return Err(FpError::busy(name, "pushed to hardware"));
            }
            warn!(table = %name, addr = %table.dmem_addr,
                "force-destroying table with live hardware address");
        }

        let members = self.tables.get_mut(name).map(|t| std::mem::take(&mut t.rules));
        if let Some(members) = members {
            for member in members {
                if let Some(rule) = self.rules.get_mut(&member) {
                    rule.table = None;
                }
            }
        }

        debug!(table = %name, "destroying FP table");
        self.tables.remove(name);
        self.table_order.retain(|n| n != name);
        Ok(())
    }

    /// Attaches a rule to a table at the requested position.
    ///
    /// # Errors
    ///
    /// `NotFound` when either name is unknown, `Busy` when the rule is
    /// already attached to a table. A numeric position beyond the chain
    /// length falls back to appending, with a warning.
    pub fn add_rule_to_table(
        &mut self,
        table_name: &str,
        rule_name: &str,
        position: TablePosition,
    ) -> FpResult<()> {
        if !self.tables.contains_key(table_name) {
            return Err(FpError::not_found(table_name));
        }
        let rule = self
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| FpError::not_found(rule_name))?;
        if let Some(owner) = &rule.table {
            return Err(FpError::busy(
                rule_name,
                format!("already member of table {}", owner),
            ));
        }
        rule.table = Some(table_name.to_string());

        let table = self
            .tables
            .get_mut(table_name)
            .ok_or_else(|| FpError::not_found(table_name))?;
        let index = match position {
            TablePosition::First => 0,
            TablePosition::Last => table.rules.len(),
            TablePosition::At(pos) => {
                let pos = pos as usize;
                if pos > table.rules.len() {
                    warn!(table = %table_name, rule = %rule_name, pos,
                        "insert position beyond chain length, appending");
                    table.rules.len()
                } else {
                    pos
                }
            }
        };
        table.rules.insert(index, rule_name.to_string());
        debug!(table = %table_name, rule = %rule_name, index, "rule attached");
        Ok(())
    }

    /// Detaches a rule from whatever table holds it.
    ///
    /// Detaching an unattached rule is a warning, not an error, so unuse
    /// commands are idempotent.
    pub fn remove_rule_from_table(&mut self, rule_name: &str) -> FpResult<()> {
        let rule = self
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| FpError::not_found(rule_name))?;
        let Some(table_name) = rule.table.take() else {
            warn!(rule = %rule_name, "rule is not attached to any table");
            return Ok(());
        };

        if let Some(table) = self.tables.get_mut(&table_name) {
            table.rules.retain(|n| n != rule_name);
        }
        debug!(table = %table_name, rule = %rule_name, "rule detached");
        Ok(())
    }

    /// Returns true if a rule with this name exists.
    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Returns true if a table with this name exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Returns the number of rules in a table.
    pub fn table_rule_count(&self, table_name: &str) -> FpResult<usize> {
        self.tables
            .get(table_name)
            .map(|t| t.rules.len())
            .ok_or_else(|| FpError::not_found(table_name))
    }

    /// Returns a snapshot of one rule.
    pub fn get_rule(&self, name: &str) -> FpResult<FpRuleInfo> {
        self.rules
            .get(name)
            .map(FpRule::snapshot)
            .ok_or_else(|| FpError::not_found(name))
    }

    /// Returns the table's DMEM address, NULL when unknown or not pushed.
    pub fn table_dmem_addr(&self, table_name: &str) -> DmemAddr {
        self.tables
            .get(table_name)
            .map(|t| t.dmem_addr)
            .unwrap_or(DmemAddr::NULL)
    }

    /// Reverse lookup: finds the table pushed at `addr`.
    pub fn table_from_addr(&self, addr: DmemAddr) -> Option<&str> {
        if addr.is_null() {
            return None;
        }
        self.table_order
            .iter()
            .find(|name| {
                self.tables
                    .get(*name)
                    .is_some_and(|t| t.dmem_addr == addr)
            })
            .map(String::as_str)
    }

    /// Returns the ordinal of `rule_name` within `table_name`'s chain.
    pub fn rule_position(&self, table_name: &str, rule_name: &str) -> Option<usize> {
        self.tables
            .get(table_name)?
            .rules
            .iter()
            .position(|n| n == rule_name)
    }

    /// Advances a global-rule cursor, returning the next rule snapshot.
    ///
    /// Returns `None` when the enumeration is exhausted.
    pub fn next_rule(&self, cursor: &mut RuleCursor) -> Option<FpRuleInfo> {
        let index = Self::resync(&self.rule_order, cursor.last.as_deref(), cursor.next_index);
        let name = self.rule_order.get(index)?;
        let info = self.rules.get(name).map(FpRule::snapshot)?;
        cursor.last = Some(name.clone());
        cursor.next_index = index + 1;
        Some(info)
    }

    /// Advances a table-scoped cursor, returning the next member snapshot.
    ///
    /// # Errors
    ///
    /// `NotFound` when the cursor's table no longer exists.
    pub fn next_table_rule(&self, cursor: &mut TableRuleCursor) -> FpResult<Option<FpRuleInfo>> {
        let table = self
            .tables
            .get(&cursor.table)
            .ok_or_else(|| FpError::not_found(&cursor.table))?;
        let index = Self::resync(&table.rules, cursor.last.as_deref(), cursor.next_index);
        let Some(name) = table.rules.get(index) else {
            return Ok(None);
        };
        let info = self
            .rules
            .get(name)
            .map(FpRule::snapshot)
            .ok_or_else(|| FpError::not_found(name))?;
        cursor.last = Some(name.clone());
        cursor.next_index = index + 1;
        Ok(Some(info))
    }

    /// Computes the next enumeration index for a cursor.
    ///
    /// When the last returned element still exists, the successor follows
    /// it; when it was removed, its old slot already holds the successor.
    fn resync(order: &[String], last: Option<&str>, next_index: usize) -> usize {
        match last {
            None => 0,
            Some(last) => match order.iter().position(|n| n == last) {
                Some(pos) => pos + 1,
                None => next_index.saturating_sub(1),
            },
        }
    }

    pub(crate) fn table(&self, name: &str) -> FpResult<&FpTable> {
        self.tables.get(name).ok_or_else(|| FpError::not_found(name))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> FpResult<&mut FpTable> {
        self.tables.get_mut(name).ok_or_else(|| FpError::not_found(name))
    }

    pub(crate) fn rule(&self, name: &str) -> FpResult<&FpRule> {
        self.rules.get(name).ok_or_else(|| FpError::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_rule(name: &str) -> FpRuleSpec {
        FpRuleSpec {
            name: name.to_string(),
            data: 0x0800,
            mask: 0xffff,
            offset: 12,
            flags: RuleFlags::ACCEPT,
            next_rule: None,
        }
    }

    fn chain_rule(name: &str, next: &str) -> FpRuleSpec {
        FpRuleSpec {
            name: name.to_string(),
            data: 0,
            mask: 0,
            offset: 0,
            flags: RuleFlags::default(),
            next_rule: Some(next.to_string()),
        }
    }

    #[test]
    fn test_create_rule_duplicate() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("r0")).unwrap();
        let err = db.create_rule(accept_rule("r0")).unwrap_err();
        assert!(matches!(err, FpError::AlreadyExists { .. }));

        // First entity is unmodified.
        assert_eq!(db.get_rule("r0").unwrap().data, 0x0800);
    }

    #[test]
    fn test_create_rule_contradictory_flags() {
        let mut db = FpDb::new();
        let mut spec = accept_rule("bad");
        spec.flags = RuleFlags::ACCEPT.with(RuleFlags::REJECT);
        assert!(matches!(
            db.create_rule(spec),
            Err(FpError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_create_rule_chain_without_next() {
        let mut db = FpDb::new();
        let mut spec = accept_rule("bad");
        spec.flags = RuleFlags::default();
        spec.next_rule = None;
        assert!(matches!(
            db.create_rule(spec),
            Err(FpError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_create_table_duplicate() {
        let mut db = FpDb::new();
        db.create_table("t0").unwrap();
        db.create_rule(accept_rule("r0")).unwrap();
        db.add_rule_to_table("t0", "r0", TablePosition::Last).unwrap();

        let err = db.create_table("t0").unwrap_err();
        assert!(matches!(err, FpError::AlreadyExists { .. }));
        // First table is unmodified.
        assert_eq!(db.table_rule_count("t0").unwrap(), 1);
    }

    #[test]
    fn test_destroy_rule_busy_while_attached() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("r0")).unwrap();
        db.create_table("t0").unwrap();
        db.add_rule_to_table("t0", "r0", TablePosition::Last).unwrap();

        assert!(matches!(db.destroy_rule("r0"), Err(FpError::Busy { .. })));

        db.remove_rule_from_table("r0").unwrap();
        db.destroy_rule("r0").unwrap();
        assert!(!db.has_rule("r0"));
    }

    #[test]
    fn test_ownership_exclusive() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("r0")).unwrap();
        db.create_table("a").unwrap();
        db.create_table("b").unwrap();

        db.add_rule_to_table("a", "r0", TablePosition::Last).unwrap();
        let err = db.add_rule_to_table("b", "r0", TablePosition::Last).unwrap_err();
        assert!(matches!(err, FpError::Busy { .. }));

        db.remove_rule_from_table("r0").unwrap();
        db.add_rule_to_table("b", "r0", TablePosition::Last).unwrap();
        assert_eq!(db.get_rule("r0").unwrap().table.as_deref(), Some("b"));
    }

    #[test]
    fn test_position_insertion_order() {
        let mut db = FpDb::new();
        for name in ["rule1", "rule2", "rule3"] {
            db.create_rule(accept_rule(name)).unwrap();
        }
        db.create_table("t").unwrap();

        db.add_rule_to_table("t", "rule1", TablePosition::Last).unwrap();
        db.add_rule_to_table("t", "rule2", TablePosition::First).unwrap();
        db.add_rule_to_table("t", "rule3", TablePosition::At(1)).unwrap();

        let mut cursor = TableRuleCursor::start("t");
        let mut order = Vec::new();
        while let Some(info) = db.next_table_rule(&mut cursor).unwrap() {
            order.push(info.name);
        }
        assert_eq!(order, vec!["rule2", "rule3", "rule1"]);
    }

    #[test]
    fn test_position_out_of_range_appends() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("r0")).unwrap();
        db.create_rule(accept_rule("r1")).unwrap();
        db.create_table("t").unwrap();

        db.add_rule_to_table("t", "r0", TablePosition::Last).unwrap();
        db.add_rule_to_table("t", "r1", TablePosition::At(99)).unwrap();
        assert_eq!(db.rule_position("t", "r1"), Some(1));
    }

    #[test]
    fn test_remove_unattached_rule_is_noop() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("r0")).unwrap();
        assert!(db.remove_rule_from_table("r0").is_ok());
        assert!(matches!(
            db.remove_rule_from_table("ghost"),
            Err(FpError::NotFound { .. })
        ));
    }

    #[test]
    fn test_destroy_table_unlinks_members() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("r0")).unwrap();
        db.create_rule(accept_rule("r1")).unwrap();
        db.create_table("t").unwrap();
        db.add_rule_to_table("t", "r0", TablePosition::Last).unwrap();
        db.add_rule_to_table("t", "r1", TablePosition::Last).unwrap();

        db.destroy_table("t", false).unwrap();
        assert!(db.get_rule("r0").unwrap().table.is_none());
        assert!(db.get_rule("r1").unwrap().table.is_none());

        // Former members are independently destroyable now.
        db.destroy_rule("r0").unwrap();
        db.destroy_rule("r1").unwrap();
    }

    #[test]
    fn test_global_cursor_enumerates_once() {
        let mut db = FpDb::new();
        db.create_rule(accept_rule("a")).unwrap();
        db.create_rule(accept_rule("b")).unwrap();
        db.create_rule(accept_rule("c")).unwrap();
        db.create_table("t").unwrap();
        db.add_rule_to_table("t", "b", TablePosition::Last).unwrap();

        let mut cursor = RuleCursor::start();
        let mut seen = Vec::new();
        while let Some(info) = db.next_rule(&mut cursor) {
            seen.push(info.name);
        }
        // Table membership does not affect the global enumeration.
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(db.next_rule(&mut cursor).is_none());
    }

    #[test]
    fn test_cursor_skips_destroyed_element() {
        let mut db = FpDb::new();
        for name in ["a", "b", "c"] {
            db.create_rule(accept_rule(name)).unwrap();
        }

        let mut cursor = RuleCursor::start();
        assert_eq!(db.next_rule(&mut cursor).unwrap().name, "a");
        assert_eq!(db.next_rule(&mut cursor).unwrap().name, "b");

        // Destroying the element the cursor sits on must not repeat or skip.
        db.destroy_rule("b").unwrap();
        assert_eq!(db.next_rule(&mut cursor).unwrap().name, "c");
        assert!(db.next_rule(&mut cursor).is_none());
    }

    #[test]
    fn test_table_cursor_on_destroyed_table() {
        let mut db = FpDb::new();
        db.create_table("t").unwrap();
        let mut cursor = TableRuleCursor::start("t");
        db.destroy_table("t", false).unwrap();
        assert!(matches!(
            db.next_table_rule(&mut cursor),
            Err(FpError::NotFound { .. })
        ));
    }

    #[test]
    fn test_chain_rule_creation() {
        let mut db = FpDb::new();
        db.create_rule(chain_rule("a", "b")).unwrap();
        let info = db.get_rule("a").unwrap();
        assert_eq!(info.next_rule.as_deref(), Some("b"));
        assert!(!info.flags.is_terminal());
    }
}
