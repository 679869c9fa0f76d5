//! Flexible Parser command dispatch.
//!
//! The session translates wire frames into database and pusher calls and
//! maps every result onto a wire status. It owns nothing but the query
//! cursors: the QUERY/QUERY_CONT protocol is stateful on the wire, and
//! that state lives here rather than in the database, so each client
//! session gets its own independent enumeration.
//!
//! The session runs in one designated worker context; the caller holds
//! the domain database locked for the duration of each call.

use crate::status::FciStatus;
use crate::wire::{
    decode_rule_cmd, decode_table_cmd, encode_rule_reply, rule_flags_of, FpAction, FpRuleCmd,
};
use pfe_dmem::Dmem;
use pfe_fp::{pop_table, push_table, FpDb, FpRuleSpec, FpResult, RuleCursor, TableRuleCursor};
use tracing::{debug, warn};

/// Per-client FCI session for the Flexible Parser command families.
#[derive(Default)]
pub struct FpFciSession {
    rule_cursor: Option<RuleCursor>,
    table_cursor: Option<TableRuleCursor>,
}

fn status_of(result: FpResult<()>) -> FciStatus {
    match result {
        Ok(()) => FciStatus::Ok,
        Err(err) => {
            debug!(%err, "FP command failed");
            FciStatus::from(&err)
        }
    }
}

impl FpFciSession {
    /// Creates a session with no query in progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one rule command frame.
    ///
    /// Returns the wire status and the number of reply bytes produced
    /// (non-zero only for successful queries).
    pub fn process_rule_cmd(
        &mut self,
        db: &mut FpDb,
        frame: &[u8],
        reply: &mut [u8],
    ) -> (FciStatus, usize) {
        let cmd = match decode_rule_cmd(frame) {
            Ok(cmd) => cmd,
            Err(status) => return (status, 0),
        };

        match cmd.action {
            FpAction::Register => (status_of(db.create_rule(rule_spec_of(&cmd))), 0),
            FpAction::Deregister => (status_of(db.destroy_rule(&cmd.name)), 0),
            FpAction::Query => {
                // A new query invalidates whatever came before it.
                self.rule_cursor = Some(RuleCursor::start());
                self.rule_query_step(db, reply)
            }
            FpAction::QueryCont => self.rule_query_step(db, reply),
            other => {
                warn!(?other, "action not valid for rule commands");
                (FciStatus::UnknownAction, 0)
            }
        }
    }

    fn rule_query_step(&mut self, db: &FpDb, reply: &mut [u8]) -> (FciStatus, usize) {
        let cursor = self.rule_cursor.get_or_insert_with(RuleCursor::start);
        match db.next_rule(cursor) {
            Some(info) => match encode_rule_reply(&info, reply) {
                Ok(len) => (FciStatus::Ok, len),
                Err(status) => (status, 0),
            },
            None => (FciStatus::EntryNotFound, 0),
        }
    }

    /// Processes one table command frame.
    pub fn process_table_cmd(
        &mut self,
        db: &mut FpDb,
        dmem: &mut dyn Dmem,
        frame: &[u8],
        reply: &mut [u8],
    ) -> (FciStatus, usize) {
        let cmd = match decode_table_cmd(frame) {
            Ok(cmd) => cmd,
            Err(status) => return (status, 0),
        };

        match cmd.action {
            FpAction::Register => (status_of(db.create_table(&cmd.table_name)), 0),
            FpAction::Deregister => (
                status_of(db.destroy_table(&cmd.table_name, cmd.flag_set())),
                0,
            ),
            FpAction::UseRule => (
                status_of(db.add_rule_to_table(
                    &cmd.table_name,
                    &cmd.rule_name,
                    cmd.table_position(),
                )),
                0,
            ),
            FpAction::UnuseRule => (status_of(db.remove_rule_from_table(&cmd.rule_name)), 0),
            FpAction::Enable => {
                let result = if cmd.flag_set() {
                    push_table(db, dmem, &cmd.table_name).map(|_| ())
                } else {
                    pop_table(db, dmem, &cmd.table_name)
                };
                (status_of(result), 0)
            }
            FpAction::Query => {
                self.table_cursor = Some(TableRuleCursor::start(&cmd.table_name));
                self.table_query_step(db, reply)
            }
            FpAction::QueryCont => {
                // A continue against a different table restarts there.
                let stale = self
                    .table_cursor
                    .as_ref()
                    .map_or(true, |c| c.table() != cmd.table_name);
                if stale {
                    self.table_cursor = Some(TableRuleCursor::start(&cmd.table_name));
                }
                self.table_query_step(db, reply)
            }
        }
    }

    fn table_query_step(&mut self, db: &FpDb, reply: &mut [u8]) -> (FciStatus, usize) {
        let Some(cursor) = self.table_cursor.as_mut() else {
            return (FciStatus::EntryNotFound, 0);
        };
        match db.next_table_rule(cursor) {
            Ok(Some(info)) => match encode_rule_reply(&info, reply) {
                Ok(len) => (FciStatus::Ok, len),
                Err(status) => (status, 0),
            },
            Ok(None) => (FciStatus::EntryNotFound, 0),
            Err(err) => (FciStatus::from(&err), 0),
        }
    }
}

fn rule_spec_of(cmd: &FpRuleCmd) -> FpRuleSpec {
    FpRuleSpec {
        name: cmd.name.clone(),
        data: cmd.data,
        mask: cmd.mask,
        offset: cmd.offset,
        flags: rule_flags_of(cmd),
        next_rule: if cmd.next_rule.is_empty() {
            None
        } else {
            Some(cmd.next_rule.clone())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        encode_rule_cmd, encode_table_cmd, FpTableCmd, MatchAction, POSITION_LAST, RULE_CMD_SIZE,
        RULE_REPLY_SIZE, TABLE_CMD_SIZE,
    };
    use pfe_dmem::HostDmem;
    use pfe_fp::OffsetBase;
    use pretty_assertions::assert_eq;

    fn rule_frame(action: FpAction, name: &str, match_action: MatchAction, next: &str) -> Vec<u8> {
        encode_rule_cmd(&FpRuleCmd {
            action,
            name: name.into(),
            data: 0x0800,
            mask: 0xffff,
            offset: 12,
            invert: false,
            match_action,
            offset_base: OffsetBase::FrameStart,
            next_rule: next.into(),
        })
        .unwrap()
    }

    fn table_frame(action: FpAction, table: &str, rule: &str, position: u16, flags: u16) -> Vec<u8> {
        encode_table_cmd(&FpTableCmd {
            action,
            table_name: table.into(),
            rule_name: rule.into(),
            position,
            flags,
        })
        .unwrap()
    }

    fn reply_buf() -> Vec<u8> {
        vec![0u8; RULE_REPLY_SIZE]
    }

    #[test]
    fn test_register_and_duplicate() {
        let mut db = FpDb::new();
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        let frame = rule_frame(FpAction::Register, "ipv4", MatchAction::Accept, "");
        let (status, len) = session.process_rule_cmd(&mut db, &frame, &mut reply);
        assert_eq!(status, FciStatus::Ok);
        assert_eq!(len, 0);
        assert!(db.has_rule("ipv4"));

        let (status, _) = session.process_rule_cmd(&mut db, &frame, &mut reply);
        assert_eq!(status, FciStatus::EntryAlreadyRegistered);
    }

    #[test]
    fn test_wrong_command_size() {
        let mut db = FpDb::new();
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        let (status, len) =
            session.process_rule_cmd(&mut db, &[0u8; RULE_CMD_SIZE - 4], &mut reply);
        assert_eq!(status, FciStatus::WrongCommandSize);
        assert_eq!(len, 0);

        let mut dmem = HostDmem::new(256);
        let (status, _) =
            session.process_table_cmd(&mut db, &mut dmem, &[0u8; TABLE_CMD_SIZE + 1], &mut reply);
        assert_eq!(status, FciStatus::WrongCommandSize);
    }

    #[test]
    fn test_unknown_action_is_distinct() {
        let mut db = FpDb::new();
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        let mut frame = rule_frame(FpAction::Register, "r", MatchAction::Accept, "");
        frame[0] = 0xff;
        frame[1] = 0xff;
        let (status, _) = session.process_rule_cmd(&mut db, &frame, &mut reply);
        assert_eq!(status, FciStatus::UnknownAction);

        // Table-only actions are unknown in the rule family.
        let frame = rule_frame(FpAction::UseRule, "r", MatchAction::Accept, "");
        let (status, _) = session.process_rule_cmd(&mut db, &frame, &mut reply);
        assert_eq!(status, FciStatus::UnknownAction);
    }

    #[test]
    fn test_invalid_rule_maps_to_invalid_argument() {
        let mut db = FpDb::new();
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        // Chaining match-action without a next-rule name.
        let frame = rule_frame(FpAction::Register, "r", MatchAction::NextRule, "");
        let (status, _) = session.process_rule_cmd(&mut db, &frame, &mut reply);
        assert_eq!(status, FciStatus::InvalidArgument);
    }

    #[test]
    fn test_table_lifecycle_via_commands() {
        let mut db = FpDb::new();
        let mut dmem = HostDmem::new(1024);
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        for (name, next, action) in [
            ("a", "b", MatchAction::NextRule),
            ("b", "", MatchAction::Accept),
        ] {
            let frame = rule_frame(FpAction::Register, name, action, next);
            assert_eq!(
                session.process_rule_cmd(&mut db, &frame, &mut reply).0,
                FciStatus::Ok
            );
        }

        let frame = table_frame(FpAction::Register, "flow", "", 0, 0);
        assert_eq!(
            session
                .process_table_cmd(&mut db, &mut dmem, &frame, &mut reply)
                .0,
            FciStatus::Ok
        );

        for rule in ["a", "b"] {
            let frame = table_frame(FpAction::UseRule, "flow", rule, POSITION_LAST, 0);
            assert_eq!(
                session
                    .process_table_cmd(&mut db, &mut dmem, &frame, &mut reply)
                    .0,
                FciStatus::Ok
            );
        }

        // Activate: push to hardware.
        let frame = table_frame(FpAction::Enable, "flow", "", 0, 1);
        assert_eq!(
            session
                .process_table_cmd(&mut db, &mut dmem, &frame, &mut reply)
                .0,
            FciStatus::Ok
        );
        assert!(!db.table_dmem_addr("flow").is_null());

        // Destroy while pushed: in use without the force flag.
        let frame = table_frame(FpAction::Deregister, "flow", "", 0, 0);
        assert_eq!(
            session
                .process_table_cmd(&mut db, &mut dmem, &frame, &mut reply)
                .0,
            FciStatus::EntryInUse
        );

        // Deactivate, then destroy cleanly.
        let frame = table_frame(FpAction::Enable, "flow", "", 0, 0);
        assert_eq!(
            session
                .process_table_cmd(&mut db, &mut dmem, &frame, &mut reply)
                .0,
            FciStatus::Ok
        );
        assert_eq!(dmem.outstanding(), 0);

        let frame = table_frame(FpAction::Deregister, "flow", "", 0, 0);
        assert_eq!(
            session
                .process_table_cmd(&mut db, &mut dmem, &frame, &mut reply)
                .0,
            FciStatus::Ok
        );
    }

    #[test]
    fn test_rule_query_enumeration() {
        let mut db = FpDb::new();
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        for name in ["r0", "r1"] {
            let frame = rule_frame(FpAction::Register, name, MatchAction::Accept, "");
            session.process_rule_cmd(&mut db, &frame, &mut reply);
        }

        let query = rule_frame(FpAction::Query, "", MatchAction::Accept, "");
        let (status, len) = session.process_rule_cmd(&mut db, &query, &mut reply);
        assert_eq!(status, FciStatus::Ok);
        assert_eq!(len, RULE_REPLY_SIZE);
        assert_eq!(&reply[0..2], b"r0");

        let cont = rule_frame(FpAction::QueryCont, "", MatchAction::Accept, "");
        let (status, len) = session.process_rule_cmd(&mut db, &cont, &mut reply);
        assert_eq!(status, FciStatus::Ok);
        assert_eq!(len, RULE_REPLY_SIZE);
        assert_eq!(&reply[0..2], b"r1");

        let (status, len) = session.process_rule_cmd(&mut db, &cont, &mut reply);
        assert_eq!(status, FciStatus::EntryNotFound);
        assert_eq!(len, 0);

        // A fresh query restarts the enumeration.
        let (status, _) = session.process_rule_cmd(&mut db, &query, &mut reply);
        assert_eq!(status, FciStatus::Ok);
        assert_eq!(&reply[0..2], b"r0");
    }

    #[test]
    fn test_table_query_scoped_to_table() {
        let mut db = FpDb::new();
        let mut dmem = HostDmem::new(1024);
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        for name in ["x", "y", "z"] {
            let frame = rule_frame(FpAction::Register, name, MatchAction::Accept, "");
            session.process_rule_cmd(&mut db, &frame, &mut reply);
        }
        let frame = table_frame(FpAction::Register, "t", "", 0, 0);
        session.process_table_cmd(&mut db, &mut dmem, &frame, &mut reply);
        for rule in ["z", "x"] {
            let frame = table_frame(FpAction::UseRule, "t", rule, POSITION_LAST, 0);
            session.process_table_cmd(&mut db, &mut dmem, &frame, &mut reply);
        }

        let query = table_frame(FpAction::Query, "t", "", 0, 0);
        let (status, _) = session.process_table_cmd(&mut db, &mut dmem, &query, &mut reply);
        assert_eq!(status, FciStatus::Ok);
        assert_eq!(&reply[0..1], b"z");

        let cont = table_frame(FpAction::QueryCont, "t", "", 0, 0);
        let (status, _) = session.process_table_cmd(&mut db, &mut dmem, &cont, &mut reply);
        assert_eq!(status, FciStatus::Ok);
        assert_eq!(&reply[0..1], b"x");

        let (status, len) = session.process_table_cmd(&mut db, &mut dmem, &cont, &mut reply);
        assert_eq!(status, FciStatus::EntryNotFound);
        assert_eq!(len, 0);
    }

    #[test]
    fn test_unuse_rule_is_idempotent() {
        let mut db = FpDb::new();
        let mut dmem = HostDmem::new(1024);
        let mut session = FpFciSession::new();
        let mut reply = reply_buf();

        let frame = rule_frame(FpAction::Register, "r", MatchAction::Accept, "");
        session.process_rule_cmd(&mut db, &frame, &mut reply);

        // Unuse of an unattached rule succeeds with a warning.
        let frame = table_frame(FpAction::UnuseRule, "", "r", 0, 0);
        let (status, _) = session.process_table_cmd(&mut db, &mut dmem, &frame, &mut reply);
        assert_eq!(status, FciStatus::Ok);

        // Unknown rule is a distinct failure.
        let frame = table_frame(FpAction::UnuseRule, "", "ghost", 0, 0);
        let (status, _) = session.process_table_cmd(&mut db, &mut dmem, &frame, &mut reply);
        assert_eq!(status, FciStatus::EntryNotFound);
    }
}
