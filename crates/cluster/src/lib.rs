//! Consistent-hash cluster layer
//!
//! Routes commands to owning nodes through the ring, executes multi-key
//! commands as try-commit-cancel distributed transactions, and exposes the
//! participant RPC surface (PREPARE / COMMIT / ROLLBACK) to peer nodes.
//!
//! A node with no peers degenerates cleanly: every key maps to itself and
//! every command takes the local path.

mod client;
mod tcc;
mod transaction;

pub use transaction::{Transaction, TxStatus};

use aof::AofHandler;
use client::ClientPool;
use parking_lot::RwLock;
use resp::{CmdLine, RespValue};
use rr_core::Ring;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::Store;
use tcc::TxIdGenerator;
use tracing::error;

/// How long a prepared transaction may hold its key locks before the
/// participant unilaterally rolls back.
pub const MAX_LOCK_TIME: Duration = Duration::from_secs(3);

/// How long terminal transaction records linger so late coordinator messages
/// still find them. Twice the lock timeout.
pub const WAIT_BEFORE_CLEAN_TX: Duration = Duration::from_secs(6);

/// Per-connection state.
#[derive(Debug, Default)]
pub struct Session {
    pub db_index: usize,
}

/// Cluster construction parameters.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's advertised address; also its identity on the ring.
    pub self_addr: String,
    /// Peer node addresses.
    pub peers: Vec<String>,
    /// Virtual nodes per physical node on the ring.
    pub replicas: usize,
}

type PrepareHook = fn(&Arc<Cluster>, &Session, &CmdLine) -> RespValue;

/// One node's view of the cluster.
pub struct Cluster {
    self_addr: String,
    ring: Ring,
    store: Arc<Store>,
    aof: Option<Arc<AofHandler>>,
    transactions: RwLock<HashMap<String, Arc<Transaction>>>,
    clients: ClientPool,
    tx_ids: TxIdGenerator,
    prepare_hooks: HashMap<&'static str, PrepareHook>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        store: Arc<Store>,
        aof: Option<Arc<AofHandler>>,
    ) -> Arc<Self> {
        let mut ring = Ring::new(config.replicas);
        ring.add_nodes(
            std::iter::once(config.self_addr.clone()).chain(config.peers.iter().cloned()),
        );

        let mut prepare_hooks: HashMap<&'static str, PrepareHook> = HashMap::new();
        prepare_hooks.insert("msetnx", prepare_msetnx);

        Arc::new(Self {
            self_addr: config.self_addr,
            ring,
            store,
            aof,
            transactions: RwLock::new(HashMap::new()),
            clients: ClientPool::new(),
            tx_ids: TxIdGenerator::new(),
            prepare_hooks,
        })
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn transactions(&self) -> &RwLock<HashMap<String, Arc<Transaction>>> {
        &self.transactions
    }

    pub(crate) fn prepare_hook(&self, name: &str) -> Option<PrepareHook> {
        self.prepare_hooks.get(name).copied()
    }

    pub(crate) fn next_tx_id(&self) -> String {
        self.tx_ids.next_id()
    }

    /// Number of live transaction records (terminal ones included until
    /// their delayed cleanup fires).
    pub fn tx_count(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn transaction_status(&self, tx_id: &str) -> Option<TxStatus> {
        self.transactions.read().get(tx_id).map(|tx| tx.status())
    }

    /// The node owning `key`. The ring always contains at least this node.
    pub fn pick_node(&self, key: &str) -> &str {
        self.ring.pick_node(key).unwrap_or(&self.self_addr)
    }

    /// Remove a transaction record after [`WAIT_BEFORE_CLEAN_TX`].
    pub(crate) fn schedule_cleanup(self: &Arc<Self>, tx_id: &str) {
        let cluster = Arc::downgrade(self);
        let tx_id = tx_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(WAIT_BEFORE_CLEAN_TX).await;
            if let Some(cluster) = cluster.upgrade() {
                cluster.transactions.write().remove(&tx_id);
            }
        });
    }

    /// Entry point for every client or peer command on this node.
    pub async fn exec(self: &Arc<Self>, session: &mut Session, cmd_line: CmdLine) -> RespValue {
        let Some(first) = cmd_line.first() else {
            return RespValue::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(first).to_ascii_lowercase();
        match name.as_str() {
            "select" => self.exec_select(session, &cmd_line),
            "prepare" => transaction::exec_prepare(self, session, &cmd_line),
            "commit" => transaction::exec_commit(self, &cmd_line),
            "rollback" => transaction::exec_rollback(self, &cmd_line),
            "mset" => tcc::exec_mset(self, session, cmd_line, false).await,
            "msetnx" => tcc::exec_mset(self, session, cmd_line, true).await,
            "del" => tcc::exec_del(self, session, cmd_line).await,
            "mget" => tcc::exec_mget(self, session, cmd_line).await,
            "rewriteaof" => self.exec_rewrite(false).await,
            "bgrewriteaof" => self.exec_rewrite(true).await,
            _ => self.exec_default(session, cmd_line).await,
        }
    }

    fn exec_select(&self, session: &mut Session, cmd_line: &CmdLine) -> RespValue {
        if cmd_line.len() != 2 {
            return RespValue::error("ERR wrong number of arguments for 'select' command");
        }
        let index = std::str::from_utf8(&cmd_line[1])
            .ok()
            .and_then(|s| s.parse::<usize>().ok());
        match index {
            Some(index) if index < self.store.databases() => {
                session.db_index = index;
                RespValue::ok()
            }
            _ => RespValue::error("ERR DB index is out of range"),
        }
    }

    async fn exec_rewrite(&self, background: bool) -> RespValue {
        let Some(aof) = self.aof.clone() else {
            return RespValue::error("ERR append only file is disabled");
        };
        if background {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = aof.rewrite() {
                    error!("background aof rewrite failed: {}", e);
                }
            });
            return RespValue::SimpleString(bytes::Bytes::from_static(
                b"Background append only file rewriting started",
            ));
        }
        match tokio::task::spawn_blocking(move || aof.rewrite()).await {
            Ok(Ok(())) => RespValue::ok(),
            Ok(Err(e)) => RespValue::error(format!("ERR aof rewrite failed: {}", e)),
            Err(e) => RespValue::error(format!("ERR aof rewrite task failed: {}", e)),
        }
    }

    /// Single-key commands route by their first key; keyless commands run
    /// locally.
    async fn exec_default(self: &Arc<Self>, session: &mut Session, cmd_line: CmdLine) -> RespValue {
        let (write_keys, read_keys) = self.store.related_keys(&cmd_line);
        let key = write_keys.first().or_else(|| read_keys.first());
        match key {
            None => self.store.exec(session.db_index, &cmd_line),
            Some(key) => {
                let node = self.pick_node(key).to_string();
                if node == self.self_addr {
                    self.store.exec(session.db_index, &cmd_line)
                } else {
                    self.clients.request(&node, session.db_index, cmd_line).await
                }
            }
        }
    }

    /// Dispatch a coordinator-generated command: locally for this node,
    /// through the peer pool otherwise. Local transaction verbs go straight
    /// to the participant handlers.
    pub(crate) async fn relay_or_local(
        self: &Arc<Self>,
        session: &mut Session,
        node: &str,
        cmd_line: CmdLine,
    ) -> RespValue {
        if node != self.self_addr {
            return self.clients.request(node, session.db_index, cmd_line).await;
        }
        let Some(first) = cmd_line.first() else {
            return RespValue::error("ERR empty command");
        };
        match first.to_ascii_lowercase().as_slice() {
            b"prepare" => transaction::exec_prepare(self, session, &cmd_line),
            b"commit" => transaction::exec_commit(self, &cmd_line),
            b"rollback" => transaction::exec_rollback(self, &cmd_line),
            _ => self.store.exec(session.db_index, &cmd_line),
        }
    }

    /// Shutdown contract: drop peer connections. In-flight transactions are
    /// cleaned up by their timers.
    pub async fn close(&self) {
        self.clients.close().await;
    }
}

/// MSETNX's prepare hook: veto the transaction when any key already exists.
/// Runs after the keys are locked, so the probe cannot race a writer.
fn prepare_msetnx(cluster: &Arc<Cluster>, session: &Session, args: &CmdLine) -> RespValue {
    let mut probe = Vec::with_capacity(args.len() / 2 + 1);
    probe.push(bytes::Bytes::from_static(b"EXISTS"));
    for key in args[1..].iter().step_by(2) {
        probe.push(key.clone());
    }
    match cluster.store().exec_with_lock(session.db_index, &probe) {
        RespValue::Integer(0) => RespValue::ok(),
        RespValue::Integer(_) => RespValue::error("ERR key already exists, msetnx aborted"),
        other => other,
    }
}
