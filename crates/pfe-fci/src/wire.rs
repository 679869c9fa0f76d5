//! FCI wire formats for the Flexible Parser commands.
//!
//! Commands arrive as fixed-layout frames in network byte order. Names
//! are 16-byte NUL-padded ASCII fields. Two command families exist: rule
//! commands (create/destroy/query rules) and table commands (create,
//! destroy, membership editing, activation, table-scoped queries).

use crate::status::FciStatus;
use byteorder::{ByteOrder, NetworkEndian};
use pfe_fp::{FpRuleInfo, OffsetBase, RuleFlags, TablePosition};

/// Length of a name field on the wire.
pub const NAME_LEN: usize = 16;

/// Size of a rule command frame.
pub const RULE_CMD_SIZE: usize = 48;

/// Size of a table command frame.
pub const TABLE_CMD_SIZE: usize = 38;

/// Size of a serialized rule in a query reply.
pub const RULE_REPLY_SIZE: usize = 46;

/// Wire sentinel: insert before every existing rule.
pub const POSITION_FIRST: u16 = 0xfffe;

/// Wire sentinel: insert after every existing rule.
pub const POSITION_LAST: u16 = 0xffff;

/// FCI action codes for the Flexible Parser command families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FpAction {
    /// Create the named rule or table.
    Register = 0,
    /// Destroy the named rule or table.
    Deregister = 1,
    /// Attach a rule to a table.
    UseRule = 2,
    /// Detach a rule from its table.
    UnuseRule = 3,
    /// Start a query and return the first element.
    Query = 4,
    /// Continue the query started by `Query`.
    QueryCont = 5,
    /// Push the table to hardware (flag set) or pop it (flag clear).
    Enable = 6,
}

impl FpAction {
    /// Decodes a wire action code.
    pub fn from_raw(raw: u16) -> Option<FpAction> {
        match raw {
            0 => Some(FpAction::Register),
            1 => Some(FpAction::Deregister),
            2 => Some(FpAction::UseRule),
            3 => Some(FpAction::UnuseRule),
            4 => Some(FpAction::Query),
            5 => Some(FpAction::QueryCont),
            6 => Some(FpAction::Enable),
            _ => None,
        }
    }
}

/// Wire encoding of a rule's terminal behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MatchAction {
    /// Continue at the named next rule.
    NextRule = 0,
    /// Accept the frame.
    Accept = 1,
    /// Reject the frame.
    Reject = 2,
}

/// A decoded rule command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpRuleCmd {
    /// Requested action.
    pub action: FpAction,
    /// Rule name.
    pub name: String,
    /// Match data.
    pub data: u32,
    /// Match mask.
    pub mask: u32,
    /// Byte offset from the configured base.
    pub offset: u16,
    /// Invert the match result.
    pub invert: bool,
    /// Terminal behavior.
    pub match_action: MatchAction,
    /// Offset origin.
    pub offset_base: OffsetBase,
    /// Next rule name (empty unless `match_action` is `NextRule`).
    pub next_rule: String,
}

/// A decoded table command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpTableCmd {
    /// Requested action.
    pub action: FpAction,
    /// Table name.
    pub table_name: String,
    /// Rule name (membership actions only).
    pub rule_name: String,
    /// Insert position (membership actions only).
    pub position: u16,
    /// Action modifier: enable/force bit in bit 0.
    pub flags: u16,
}

impl FpTableCmd {
    /// Interprets the wire position field.
    pub fn table_position(&self) -> TablePosition {
        match self.position {
            POSITION_FIRST => TablePosition::First,
            POSITION_LAST => TablePosition::Last,
            pos => TablePosition::At(pos),
        }
    }

    /// Bit 0 of the modifier word: enable for `Enable`, force for
    /// `Deregister`.
    pub fn flag_set(&self) -> bool {
        self.flags & 0x1 != 0
    }
}

fn write_name(buf: &mut [u8], name: &str) -> Result<(), FciStatus> {
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_LEN {
        return Err(FciStatus::InvalidArgument);
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[bytes.len()..NAME_LEN].fill(0);
    Ok(())
}

fn read_name(buf: &[u8]) -> Result<String, FciStatus> {
    let end = buf[..NAME_LEN]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_LEN);
    std::str::from_utf8(&buf[..end])
        .map(str::to_string)
        .map_err(|_| FciStatus::InvalidArgument)
}

/// Encodes a rule command frame.
pub fn encode_rule_cmd(cmd: &FpRuleCmd) -> Result<Vec<u8>, FciStatus> {
    let mut frame = vec![0u8; RULE_CMD_SIZE];
    NetworkEndian::write_u16(&mut frame[0..2], cmd.action as u16);
    write_name(&mut frame[2..18], &cmd.name)?;
    NetworkEndian::write_u32(&mut frame[18..22], cmd.data);
    NetworkEndian::write_u32(&mut frame[22..26], cmd.mask);
    NetworkEndian::write_u16(&mut frame[26..28], cmd.offset);
    frame[28] = cmd.invert as u8;
    frame[29] = cmd.match_action as u8;
    frame[30] = match cmd.offset_base {
        OffsetBase::FrameStart => 0,
        OffsetBase::L3Header => 1,
        OffsetBase::L4Header => 2,
    };
    // frame[31] reserved
    write_name(&mut frame[32..48], &cmd.next_rule)?;
    Ok(frame)
}

/// Decodes a rule command frame.
pub fn decode_rule_cmd(frame: &[u8]) -> Result<FpRuleCmd, FciStatus> {
    if frame.len() != RULE_CMD_SIZE {
        return Err(FciStatus::WrongCommandSize);
    }
    let action = FpAction::from_raw(NetworkEndian::read_u16(&frame[0..2]))
        .ok_or(FciStatus::UnknownAction)?;
    let match_action = match frame[29] {
        0 => MatchAction::NextRule,
        1 => MatchAction::Accept,
        2 => MatchAction::Reject,
        _ => return Err(FciStatus::InvalidArgument),
    };
    let offset_base = match frame[30] {
        0 => OffsetBase::FrameStart,
        1 => OffsetBase::L3Header,
        2 => OffsetBase::L4Header,
        _ => return Err(FciStatus::InvalidArgument),
    };
    Ok(FpRuleCmd {
        action,
        name: read_name(&frame[2..18])?,
        data: NetworkEndian::read_u32(&frame[18..22]),
        mask: NetworkEndian::read_u32(&frame[22..26]),
        offset: NetworkEndian::read_u16(&frame[26..28]),
        invert: frame[28] != 0,
        match_action,
        offset_base,
        next_rule: read_name(&frame[32..48])?,
    })
}

/// Encodes a table command frame.
pub fn encode_table_cmd(cmd: &FpTableCmd) -> Result<Vec<u8>, FciStatus> {
    let mut frame = vec![0u8; TABLE_CMD_SIZE];
    NetworkEndian::write_u16(&mut frame[0..2], cmd.action as u16);
    write_name(&mut frame[2..18], &cmd.table_name)?;
    write_name(&mut frame[18..34], &cmd.rule_name)?;
    NetworkEndian::write_u16(&mut frame[34..36], cmd.position);
    NetworkEndian::write_u16(&mut frame[36..38], cmd.flags);
    Ok(frame)
}

/// Decodes a table command frame.
pub fn decode_table_cmd(frame: &[u8]) -> Result<FpTableCmd, FciStatus> {
    if frame.len() != TABLE_CMD_SIZE {
        return Err(FciStatus::WrongCommandSize);
    }
    let action = FpAction::from_raw(NetworkEndian::read_u16(&frame[0..2]))
        .ok_or(FciStatus::UnknownAction)?;
    Ok(FpTableCmd {
        action,
        table_name: read_name(&frame[2..18])?,
        rule_name: read_name(&frame[18..34])?,
        position: NetworkEndian::read_u16(&frame[34..36]),
        flags: NetworkEndian::read_u16(&frame[36..38]),
    })
}

/// Builds the rule flag set described by a rule command.
pub fn rule_flags_of(cmd: &FpRuleCmd) -> RuleFlags {
    let mut flags = RuleFlags::default();
    match cmd.match_action {
        MatchAction::Accept => flags = flags.with(RuleFlags::ACCEPT),
        MatchAction::Reject => flags = flags.with(RuleFlags::REJECT),
        MatchAction::NextRule => {}
    }
    if cmd.invert {
        flags = flags.with(RuleFlags::INVERT);
    }
    match cmd.offset_base {
        OffsetBase::FrameStart => {}
        OffsetBase::L3Header => flags = flags.with(RuleFlags::BASE_L3),
        OffsetBase::L4Header => flags = flags.with(RuleFlags::BASE_L4),
    }
    flags
}

/// Serializes a rule snapshot into a query reply.
///
/// The match-action, invert, and offset-base fields are reconstructed
/// from the rule's internal flag set.
pub fn encode_rule_reply(info: &FpRuleInfo, reply: &mut [u8]) -> Result<usize, FciStatus> {
    if reply.len() < RULE_REPLY_SIZE {
        return Err(FciStatus::WrongCommandSize);
    }
    write_name(&mut reply[0..16], &info.name)?;
    NetworkEndian::write_u32(&mut reply[16..20], info.data);
    NetworkEndian::write_u32(&mut reply[20..24], info.mask);
    NetworkEndian::write_u16(&mut reply[24..26], info.offset);
    reply[26] = info.flags.is_inverted() as u8;
    reply[27] = if info.flags.is_accept() {
        MatchAction::Accept as u8
    } else if info.flags.is_reject() {
        MatchAction::Reject as u8
    } else {
        MatchAction::NextRule as u8
    };
    reply[28] = match info.flags.offset_base() {
        OffsetBase::FrameStart => 0,
        OffsetBase::L3Header => 1,
        OffsetBase::L4Header => 2,
    };
    // reply[29] reserved
    write_name(&mut reply[30..46], info.next_rule.as_deref().unwrap_or(""))?;
    Ok(RULE_REPLY_SIZE)
}
