//! Multi-database store with command dispatch
//!
//! The command registry is built explicitly at construction; nothing is
//! registered through global state. Three execution paths exist:
//!
//! - [`Store::exec`] — locks the command's related keys around execution.
//! - [`Store::exec_with_lock`] — the caller already holds the key locks
//!   (the distributed-transaction commit/rollback path).
//! - [`Store::exec_for_replay`] — no locking, no append-only-file emission
//!   (the recovery path; nothing else runs during replay).

use crate::commands::{self, CommandSpec};
use crate::db::Db;
use crate::entity::{entity_to_cmd, expire_cmd};
use crate::locks::LockMap;
use bytes::Bytes;
use parking_lot::RwLock;
use resp::{CmdLine, RespValue};
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::mpsc;

const LOCK_SLOTS: usize = 1024;

/// One executed mutation, as submitted to the append-only file.
#[derive(Debug)]
pub struct AofPayload {
    pub db_index: usize,
    pub cmd_line: CmdLine,
}

/// Sink half of the append-only-file channel.
pub type AofSender = mpsc::UnboundedSender<AofPayload>;

/// The in-memory database engine: `databases` logical keyspaces behind one
/// striped key-lock map and one command registry.
pub struct Store {
    dbs: Vec<Db>,
    locks: LockMap,
    registry: HashMap<&'static str, CommandSpec>,
    aof_sink: RwLock<Option<AofSender>>,
}

impl Store {
    /// # Panics
    /// Panics if `databases` is zero.
    pub fn new(databases: usize) -> Self {
        assert!(databases > 0, "store requires at least one database");
        Self {
            dbs: (0..databases).map(|_| Db::new()).collect(),
            locks: LockMap::new(LOCK_SLOTS),
            registry: commands::registry(),
            aof_sink: RwLock::new(None),
        }
    }

    pub fn databases(&self) -> usize {
        self.dbs.len()
    }

    /// Attach (or detach) the append-only-file sink. Successful mutations are
    /// forwarded to it from then on.
    pub fn set_aof_sink(&self, sink: Option<AofSender>) {
        *self.aof_sink.write() = sink;
    }

    /// Execute a command, taking and releasing its related key locks.
    pub fn exec(&self, db_index: usize, cmd_line: &CmdLine) -> RespValue {
        let (write_keys, read_keys) = self.related_keys(cmd_line);
        self.locks.rw_locks(&write_keys, &read_keys);
        let reply = self.exec_inner(db_index, cmd_line, true);
        self.locks.rw_unlocks(&write_keys, &read_keys);
        reply
    }

    /// Execute a command whose key locks the caller already holds.
    pub fn exec_with_lock(&self, db_index: usize, cmd_line: &CmdLine) -> RespValue {
        self.exec_inner(db_index, cmd_line, true)
    }

    /// Execute a replayed command: no locking, no append-only-file emission.
    pub fn exec_for_replay(&self, db_index: usize, cmd_line: &CmdLine) -> RespValue {
        self.exec_inner(db_index, cmd_line, false)
    }

    fn exec_inner(&self, db_index: usize, cmd_line: &CmdLine, emit: bool) -> RespValue {
        let Some(db) = self.dbs.get(db_index) else {
            return RespValue::error("ERR DB index is out of range");
        };
        let Some(first) = cmd_line.first() else {
            return RespValue::error("ERR empty command");
        };
        let name = cmd_name(first);
        let Some(spec) = self.registry.get(name.as_str()) else {
            return RespValue::error(format!("ERR unknown command '{}'", name));
        };
        if !arity_ok(spec.arity, cmd_line.len()) {
            return RespValue::error(format!(
                "ERR wrong number of arguments for '{}' command",
                name
            ));
        }
        let reply = (spec.handler)(db, cmd_line);
        if emit && spec.write && !reply.is_error() {
            match spec.aof_form {
                Some(form) => {
                    if let Some(cmd) = form(db, cmd_line) {
                        self.emit_aof(db_index, cmd);
                    }
                }
                None => self.emit_aof(db_index, cmd_line.clone()),
            }
        }
        reply
    }

    fn emit_aof(&self, db_index: usize, cmd_line: CmdLine) {
        let sink = self.aof_sink.read();
        if let Some(sender) = sink.as_ref() {
            // receiver gone means the handler is shutting down
            let _ = sender.send(AofPayload { db_index, cmd_line });
        }
    }

    /// `(write_keys, read_keys)` a command touches. Unknown commands touch
    /// nothing.
    pub fn related_keys(&self, cmd_line: &CmdLine) -> (Vec<String>, Vec<String>) {
        let Some(first) = cmd_line.first() else {
            return (Vec::new(), Vec::new());
        };
        match self.registry.get(cmd_name(first).as_str()) {
            Some(spec) => (spec.keys)(cmd_line),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Commands that logically invert `cmd_line` on the current state.
    ///
    /// Caller must hold the command's key locks; the captured state is only
    /// a valid inverse while they stay held.
    pub fn undo_logs(&self, db_index: usize, cmd_line: &CmdLine) -> Vec<CmdLine> {
        let Some(db) = self.dbs.get(db_index) else {
            return Vec::new();
        };
        let (write_keys, _) = self.related_keys(cmd_line);
        let mut undo = Vec::new();
        for key in write_keys {
            let del = resp::to_cmd_line([
                Bytes::from_static(b"DEL"),
                Bytes::copy_from_slice(key.as_bytes()),
            ]);
            match db.get_with_expire(&key) {
                None => undo.push(del),
                Some((entity, expire_at)) => {
                    undo.push(del);
                    if let Some(cmd) = entity_to_cmd(&key, &entity) {
                        undo.push(cmd);
                    }
                    if let Some(at) = expire_at {
                        undo.push(expire_cmd(&key, at));
                    }
                }
            }
        }
        undo
    }

    /// Acquire write/read locks on explicit key sets (prepare phase).
    pub fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) {
        self.locks.rw_locks(write_keys, read_keys);
    }

    /// Release locks taken by [`Store::rw_locks`].
    pub fn rw_unlocks(&self, write_keys: &[String], read_keys: &[String]) {
        self.locks.rw_unlocks(write_keys, read_keys);
    }

    /// Visit every live entry of one logical database.
    pub fn for_each<F>(&self, db_index: usize, visitor: F)
    where
        F: FnMut(&str, &crate::DataEntity, Option<SystemTime>) -> bool,
    {
        if let Some(db) = self.dbs.get(db_index) {
            db.for_each(visitor);
        }
    }
}

fn cmd_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

/// Redis-style arity: non-negative means exact, negative means at least
/// `-arity` arguments (command name included).
fn arity_ok(arity: i32, len: usize) -> bool {
    if arity >= 0 {
        len == arity as usize
    } else {
        len >= (-arity) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resp::to_cmd_line;

    fn exec(store: &Store, parts: &[&str]) -> RespValue {
        store.exec(0, &to_cmd_line(parts.iter().map(|s| s.to_string())))
    }

    #[test]
    fn set_then_get() {
        let store = Store::new(4);
        assert_eq!(exec(&store, &["SET", "k", "v"]), RespValue::ok());
        assert_eq!(
            exec(&store, &["GET", "k"]),
            RespValue::BulkString(Bytes::from("v"))
        );
        assert_eq!(exec(&store, &["GET", "missing"]), RespValue::Null);
    }

    #[test]
    fn databases_are_isolated() {
        let store = Store::new(4);
        assert_eq!(exec(&store, &["SET", "k", "v"]), RespValue::ok());
        assert_eq!(store.exec(2, &to_cmd_line(["GET", "k"])), RespValue::Null);
    }

    #[test]
    fn unknown_command_and_arity_errors() {
        let store = Store::new(1);
        assert!(exec(&store, &["NOSUCH", "x"]).is_error());
        assert!(exec(&store, &["GET"]).is_error());
        assert!(exec(&store, &["SET", "k"]).is_error());
    }

    #[test]
    fn out_of_range_db_is_an_error() {
        let store = Store::new(2);
        assert!(store.exec(5, &to_cmd_line(["GET", "k"])).is_error());
    }

    #[test]
    fn write_commands_reach_the_aof_sink() {
        let store = Store::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_aof_sink(Some(tx));

        exec(&store, &["SET", "k", "v"]);
        exec(&store, &["GET", "k"]);
        store.exec(1, &to_cmd_line(["DEL", "nope"]));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.db_index, 0);
        assert_eq!(first.cmd_line, to_cmd_line(["SET", "k", "v"]));
        // GET is not a write; DEL on db 1 is
        let second = rx.try_recv().unwrap();
        assert_eq!(second.db_index, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn expire_is_persisted_as_absolute_pexpireat() {
        let store = Store::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        exec(&store, &["SET", "k", "v"]);
        store.set_aof_sink(Some(tx));

        assert_eq!(exec(&store, &["EXPIRE", "k", "100"]), RespValue::Integer(1));
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.cmd_line[0], Bytes::from_static(b"PEXPIREAT"));
        assert_eq!(payload.cmd_line[1], Bytes::from_static(b"k"));
    }

    #[test]
    fn replay_does_not_emit() {
        let store = Store::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_aof_sink(Some(tx));
        store.exec_for_replay(0, &to_cmd_line(["SET", "k", "v"]));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            exec(&store, &["GET", "k"]),
            RespValue::BulkString(Bytes::from("v"))
        );
    }

    #[test]
    fn undo_restores_overwritten_value() {
        let store = Store::new(1);
        exec(&store, &["SET", "k", "old"]);

        let cmd = to_cmd_line(["SET", "k", "new"]);
        let undo = store.undo_logs(0, &cmd);
        store.exec(0, &cmd);
        assert_eq!(
            exec(&store, &["GET", "k"]),
            RespValue::BulkString(Bytes::from("new"))
        );

        for cmd in &undo {
            store.exec_with_lock(0, cmd);
        }
        assert_eq!(
            exec(&store, &["GET", "k"]),
            RespValue::BulkString(Bytes::from("old"))
        );
    }

    #[test]
    fn undo_deletes_created_key() {
        let store = Store::new(1);
        let cmd = to_cmd_line(["SET", "fresh", "v"]);
        let undo = store.undo_logs(0, &cmd);
        assert_eq!(
            undo,
            vec![to_cmd_line(["DEL", "fresh"])],
            "absent key inverts to DEL"
        );

        store.exec(0, &cmd);
        for cmd in &undo {
            store.exec_with_lock(0, cmd);
        }
        assert_eq!(exec(&store, &["EXISTS", "fresh"]), RespValue::Integer(0));
    }

    #[test]
    fn undo_restores_expiration() {
        let store = Store::new(1);
        exec(&store, &["SET", "k", "v"]);
        exec(&store, &["EXPIRE", "k", "1000"]);

        let undo = store.undo_logs(0, &to_cmd_line(["DEL", "k"]));
        store.exec(0, &to_cmd_line(["DEL", "k"]));
        for cmd in &undo {
            store.exec_with_lock(0, cmd);
        }

        let ttl = match exec(&store, &["TTL", "k"]) {
            RespValue::Integer(n) => n,
            other => panic!("unexpected ttl reply: {:?}", other),
        };
        assert!(ttl > 990 && ttl <= 1000, "ttl {} out of range", ttl);
    }
}
