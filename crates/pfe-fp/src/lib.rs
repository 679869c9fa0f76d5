//! Flexible Parser rule/table subsystem of the PFE driver.
//!
//! The Flexible Parser is a programmable per-packet matcher: a *rule*
//! compares a masked 32-bit word at a frame offset, a *table* is an
//! ordered chain of rules ending in accept/reject or chaining onward.
//! This crate keeps the host-side database of named rules and tables
//! ([`FpDb`]) and serializes activated tables into PE data memory
//! ([`push_table`]/[`pop_table`]).
//!
//! Access is serialized by the platform: one designated worker owns the
//! database and the DMEM handle, and every entry point takes `&mut`.

mod db;
mod error;
mod hw;
mod types;

pub use db::{FpDb, RuleCursor, TableRuleCursor};
pub use error::{FpError, FpResult};
pub use hw::{pop_table, push_table, NO_NEXT_RULE, RULE_RECORD_SIZE, TABLE_HEADER_SIZE};
pub use types::{FpRuleInfo, FpRuleSpec, OffsetBase, RuleFlags, TablePosition};
