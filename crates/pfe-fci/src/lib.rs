//! FCI command adapter for the PFE Flexible Parser.
//!
//! FCI is the runtime configuration protocol of the packet engine: a
//! client sends fixed-layout command frames and receives a status word
//! plus, for queries, a reply payload. This crate decodes the Flexible
//! Parser command families, drives the rule/table database and the table
//! pusher, and maps internal errors to wire statuses.
//!
//! The adapter is stateless apart from the per-session query cursors; it
//! executes within the platform's single command-processing worker.

mod fp;
mod status;
mod wire;

pub use fp::FpFciSession;
pub use status::FciStatus;
pub use wire::{
    decode_rule_cmd, decode_table_cmd, encode_rule_cmd, encode_rule_reply, encode_table_cmd,
    FpAction, FpRuleCmd, FpTableCmd, MatchAction, NAME_LEN, POSITION_FIRST, POSITION_LAST,
    RULE_CMD_SIZE, RULE_REPLY_SIZE, TABLE_CMD_SIZE,
};
