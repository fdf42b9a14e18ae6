//! Participant side of the try-commit-cancel protocol
//!
//! A transaction holds its keys' write/read locks from prepare until commit
//! or rollback. An unattended prepared transaction rolls itself back after
//! [`crate::MAX_LOCK_TIME`]; terminal records linger for
//! [`crate::WAIT_BEFORE_CLEAN_TX`] so a late coordinator message still finds
//! them.

use crate::{Cluster, Session, MAX_LOCK_TIME};
use parking_lot::Mutex;
use resp::{CmdLine, RespValue};
use std::sync::Arc;
use storage::Store;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Created,
    Prepared,
    Committed,
    RolledBack,
}

struct TxInner {
    status: TxStatus,
    write_keys: Vec<String>,
    read_keys: Vec<String>,
    /// Reentrancy guard: the key locks are taken and released at most once
    /// no matter how often lock/unlock are called.
    keys_locked: bool,
    undo_log: Vec<CmdLine>,
}

/// State of one distributed transaction on this participant.
pub struct Transaction {
    id: String,
    cmd_line: CmdLine,
    db_index: usize,
    inner: Mutex<TxInner>,
}

impl Transaction {
    fn new(id: String, cmd_line: CmdLine, db_index: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            cmd_line,
            db_index,
            inner: Mutex::new(TxInner {
                status: TxStatus::Created,
                write_keys: Vec::new(),
                read_keys: Vec::new(),
                keys_locked: false,
                undo_log: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TxStatus {
        self.inner.lock().status
    }

    fn lock_keys(&self, store: &Store, inner: &mut TxInner) {
        if !inner.keys_locked {
            store.rw_locks(&inner.write_keys, &inner.read_keys);
            inner.keys_locked = true;
        }
    }

    fn unlock_keys(&self, store: &Store, inner: &mut TxInner) {
        if inner.keys_locked {
            store.rw_unlocks(&inner.write_keys, &inner.read_keys);
            inner.keys_locked = false;
        }
    }

    /// Lock keys, capture the undo log and arm the abort timer.
    fn prepare(self: &Arc<Self>, cluster: &Arc<Cluster>) {
        let store = cluster.store();
        let mut inner = self.inner.lock();
        let (write_keys, read_keys) = store.related_keys(&self.cmd_line);
        inner.write_keys = write_keys;
        inner.read_keys = read_keys;
        self.lock_keys(store, &mut inner);
        inner.undo_log = store.undo_logs(self.db_index, &self.cmd_line);
        inner.status = TxStatus::Prepared;
        drop(inner);

        // roll back unilaterally if no commit or rollback arrives in time
        let tx = self.clone();
        let cluster = Arc::downgrade(cluster);
        tokio::spawn(async move {
            tokio::time::sleep(MAX_LOCK_TIME).await;
            let Some(cluster) = cluster.upgrade() else {
                return;
            };
            let mut inner = tx.inner.lock();
            if inner.status == TxStatus::Prepared {
                info!("abort transaction: {}", tx.id);
                let _ = tx.rollback_with_lock(cluster.store(), &mut inner);
                drop(inner);
                cluster.schedule_cleanup(&tx.id);
            }
        });
    }

    /// Idempotent: bails out when already rolled back. Reacquires the key
    /// locks if commit released them, replays the undo log in order, then
    /// releases the locks.
    fn rollback_with_lock(&self, store: &Store, inner: &mut TxInner) -> Result<(), String> {
        if inner.status == TxStatus::RolledBack {
            return Ok(());
        }
        self.lock_keys(store, inner);
        let mut first_err = None;
        for cmd_line in &inner.undo_log {
            let reply = store.exec_with_lock(self.db_index, cmd_line);
            if let RespValue::Error(msg) = reply {
                first_err.get_or_insert_with(|| String::from_utf8_lossy(&msg).into_owned());
            }
        }
        self.unlock_keys(store, inner);
        inner.status = TxStatus::RolledBack;
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// `PREPARE txID cmdName args…` — create the transaction record, lock its
/// keys, build the undo log and run the command's prepare hook if one is
/// registered (MSETNX vetoes here when any key already exists).
pub(crate) fn exec_prepare(
    cluster: &Arc<Cluster>,
    session: &Session,
    cmd_line: &CmdLine,
) -> RespValue {
    if cmd_line.len() < 3 {
        return RespValue::error("ERR wrong number of arguments for 'prepare' command");
    }
    let tx_id = String::from_utf8_lossy(&cmd_line[1]).into_owned();
    let wrapped: CmdLine = cmd_line[2..].to_vec();
    let cmd_name = String::from_utf8_lossy(&wrapped[0]).to_ascii_lowercase();

    let tx = Transaction::new(tx_id.clone(), wrapped.clone(), session.db_index);
    cluster.transactions().write().insert(tx_id, tx.clone());
    tx.prepare(cluster);

    if let Some(hook) = cluster.prepare_hook(&cmd_name) {
        return hook(cluster, session, &wrapped);
    }
    RespValue::ok()
}

/// `COMMIT txID` — execute the prepared command with its locks already held.
/// Unknown transactions reply integer 0 (late or duplicate messages are not
/// errors); a rolled-back transaction does the same. A failed execution rolls
/// back locally and reports both errors.
pub(crate) fn exec_commit(cluster: &Arc<Cluster>, cmd_line: &CmdLine) -> RespValue {
    if cmd_line.len() != 2 {
        return RespValue::error("ERR wrong number of arguments for 'commit' command");
    }
    let tx_id = String::from_utf8_lossy(&cmd_line[1]).into_owned();
    let tx = match cluster.transactions().read().get(&tx_id) {
        Some(tx) => tx.clone(),
        None => return RespValue::Integer(0),
    };

    let store = cluster.store();
    let mut inner = tx.inner.lock();
    match inner.status {
        // aborted by the timer before the commit arrived
        TxStatus::RolledBack => return RespValue::Integer(0),
        // duplicate commit: the effects are already applied
        TxStatus::Committed => return RespValue::ok(),
        TxStatus::Created | TxStatus::Prepared => {}
    }

    let reply = store.exec_with_lock(tx.db_index, &tx.cmd_line);
    if let RespValue::Error(origin) = &reply {
        let origin = String::from_utf8_lossy(origin).into_owned();
        let rollback = tx.rollback_with_lock(store, &mut inner);
        drop(inner);
        cluster.schedule_cleanup(&tx.id);
        return match rollback {
            Ok(()) => RespValue::error(format!("ERR commit failed, rolled back: {}", origin)),
            Err(e) => RespValue::error(format!(
                "ERR err occurs when rollback: {}, origin err: {}",
                e, origin
            )),
        };
    }

    tx.unlock_keys(store, &mut inner);
    inner.status = TxStatus::Committed;
    drop(inner);
    // not removed immediately: the coordinator may still order a rollback
    cluster.schedule_cleanup(&tx.id);
    reply
}

/// `ROLLBACK txID` — undo the transaction. Integer 1 on (possibly repeated)
/// rollback, integer 0 for unknown transactions.
pub(crate) fn exec_rollback(cluster: &Arc<Cluster>, cmd_line: &CmdLine) -> RespValue {
    if cmd_line.len() != 2 {
        return RespValue::error("ERR wrong number of arguments for 'rollback' command");
    }
    let tx_id = String::from_utf8_lossy(&cmd_line[1]).into_owned();
    let tx = match cluster.transactions().read().get(&tx_id) {
        Some(tx) => tx.clone(),
        None => return RespValue::Integer(0),
    };

    let store = cluster.store();
    let mut inner = tx.inner.lock();
    let result = tx.rollback_with_lock(store, &mut inner);
    drop(inner);
    cluster.schedule_cleanup(&tx.id);
    match result {
        Ok(()) => RespValue::Integer(1),
        Err(e) => RespValue::error(format!("ERR rollback failed: {}", e)),
    }
}
