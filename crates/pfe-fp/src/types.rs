//! Flexible Parser rule types.

use crate::{FpError, FpResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flexible Parser rule flags.
///
/// A rule either terminates classification (`ACCEPT` or `REJECT`, mutually
/// exclusive) or continues at a named next rule. `INVERT` negates the
/// data/mask comparison, and the base-selector bits pick the byte offset
/// origin within the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleFlags(u16);

impl RuleFlags {
    /// Matching frame is accepted; classification stops.
    pub const ACCEPT: RuleFlags = RuleFlags(0x0001);

    /// Matching frame is rejected; classification stops.
    pub const REJECT: RuleFlags = RuleFlags(0x0002);

    /// Invert the match result.
    pub const INVERT: RuleFlags = RuleFlags(0x0004);

    /// Offset is relative to the L3 header instead of the frame start.
    pub const BASE_L3: RuleFlags = RuleFlags(0x0008);

    /// Offset is relative to the L4 header instead of the frame start.
    pub const BASE_L4: RuleFlags = RuleFlags(0x0010);

    const VALID_MASK: u16 = 0x001f;

    /// Creates a flag set from a raw wire word. Unknown bits are rejected.
    pub fn from_raw(raw: u16) -> FpResult<Self> {
        if raw & !Self::VALID_MASK != 0 {
            return Err(FpError::invalid_argument(format!(
                "unknown rule flag bits: {:#06x}",
                raw
            )));
        }
        Ok(RuleFlags(raw))
    }

    /// Returns the raw wire word.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(&self, other: RuleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combines two flag sets.
    pub const fn with(self, other: RuleFlags) -> RuleFlags {
        RuleFlags(self.0 | other.0)
    }

    /// True when the rule accepts on match.
    pub const fn is_accept(&self) -> bool {
        self.contains(Self::ACCEPT)
    }

    /// True when the rule rejects on match.
    pub const fn is_reject(&self) -> bool {
        self.contains(Self::REJECT)
    }

    /// True when the rule terminates classification on match.
    pub const fn is_terminal(&self) -> bool {
        self.is_accept() || self.is_reject()
    }

    /// True when the match result is inverted.
    pub const fn is_inverted(&self) -> bool {
        self.contains(Self::INVERT)
    }

    /// Returns the configured offset base.
    pub fn offset_base(&self) -> OffsetBase {
        if self.contains(Self::BASE_L4) {
            OffsetBase::L4Header
        } else if self.contains(Self::BASE_L3) {
            OffsetBase::L3Header
        } else {
            OffsetBase::FrameStart
        }
    }

    /// Checks internal consistency against the presence of a next-rule name.
    ///
    /// ACCEPT and REJECT are mutually exclusive; a rule that sets neither
    /// must chain to a next rule. Only one offset base may be selected.
    pub fn validate(&self, has_next_rule: bool) -> FpResult<()> {
        if self.is_accept() && self.is_reject() {
            return Err(FpError::invalid_argument(
                "ACCEPT and REJECT are mutually exclusive",
            ));
        }
        if !self.is_terminal() && !has_next_rule {
            return Err(FpError::invalid_argument(
                "rule without ACCEPT/REJECT needs a next rule",
            ));
        }
        if self.contains(Self::BASE_L3) && self.contains(Self::BASE_L4) {
            return Err(FpError::invalid_argument(
                "only one offset base may be selected",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RuleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Origin of a rule's byte offset within the inspected frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OffsetBase {
    /// Offset counts from the first byte of the frame (L2).
    #[default]
    FrameStart,
    /// Offset counts from the L3 header.
    L3Header,
    /// Offset counts from the L4 header.
    L4Header,
}

/// Everything needed to create a Flexible Parser rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpRuleSpec {
    /// Unique rule name.
    pub name: String,
    /// Expected data at the inspected offset.
    pub data: u32,
    /// Bits of `data` that participate in the comparison.
    pub mask: u32,
    /// Byte offset from the configured base.
    pub offset: u16,
    /// Match behavior flags.
    pub flags: RuleFlags,
    /// Rule to continue with when this one neither accepts nor rejects.
    pub next_rule: Option<String>,
}

/// A read-only snapshot of a rule, as returned by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpRuleInfo {
    /// Rule name.
    pub name: String,
    /// Match data.
    pub data: u32,
    /// Match mask.
    pub mask: u32,
    /// Byte offset from the configured base.
    pub offset: u16,
    /// Match behavior flags.
    pub flags: RuleFlags,
    /// Chained next rule, if any.
    pub next_rule: Option<String>,
    /// Table this rule is currently a member of, if any.
    pub table: Option<String>,
}

/// Where to insert a rule into a table's ordered chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePosition {
    /// Before every existing rule.
    First,
    /// After every existing rule.
    Last,
    /// Immediately before the rule currently at this zero-based index.
    ///
    /// An index beyond the current chain length falls back to `Last`.
    At(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flags_accept_reject_exclusive() {
        let flags = RuleFlags::ACCEPT.with(RuleFlags::REJECT);
        assert!(flags.validate(false).is_err());
    }

    #[test]
    fn test_flags_chain_requires_next() {
        let flags = RuleFlags::INVERT;
        assert!(flags.validate(false).is_err());
        assert!(flags.validate(true).is_ok());
    }

    #[test]
    fn test_flags_terminal_without_next() {
        assert!(RuleFlags::ACCEPT.validate(false).is_ok());
        assert!(RuleFlags::REJECT.validate(false).is_ok());
    }

    #[test]
    fn test_flags_single_base() {
        let flags = RuleFlags::ACCEPT.with(RuleFlags::BASE_L3).with(RuleFlags::BASE_L4);
        assert!(flags.validate(false).is_err());
    }

    #[test]
    fn test_offset_base() {
        assert_eq!(RuleFlags::ACCEPT.offset_base(), OffsetBase::FrameStart);
        assert_eq!(
            RuleFlags::ACCEPT.with(RuleFlags::BASE_L3).offset_base(),
            OffsetBase::L3Header
        );
        assert_eq!(
            RuleFlags::ACCEPT.with(RuleFlags::BASE_L4).offset_base(),
            OffsetBase::L4Header
        );
    }

    #[test]
    fn test_flags_from_raw() {
        let flags = RuleFlags::from_raw(0x0005).unwrap();
        assert!(flags.is_accept());
        assert!(flags.is_inverted());

        assert!(RuleFlags::from_raw(0x8000).is_err());
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(RuleFlags::ACCEPT.to_string(), "0x0001");
    }
}
