//! Coordinator side of the try-commit-cancel protocol
//!
//! Multi-key commands group their keys by owning node through the ring. A
//! group spanning one node short-circuits to a plain relay; anything wider
//! runs prepare on every participant, then commit, rolling everyone back on
//! the first error.

use crate::{Cluster, Session};
use bytes::Bytes;
use resp::{CmdLine, RespValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Coordinator-assigned transaction ids: monotonically unique within the
/// process, timestamp-seeded so restarts do not reuse recent ids.
pub(crate) struct TxIdGenerator {
    next: AtomicI64,
}

impl TxIdGenerator {
    pub(crate) fn new() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            next: AtomicI64::new(ms << 16),
        }
    }

    pub(crate) fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// MSET / MSETNX across nodes.
pub(crate) async fn exec_mset(
    cluster: &Arc<Cluster>,
    session: &mut Session,
    cmd_line: CmdLine,
    nx: bool,
) -> RespValue {
    let name = if nx { "msetnx" } else { "mset" };
    if cmd_line.len() < 3 || (cmd_line.len() - 1) % 2 != 0 {
        return RespValue::error(format!(
            "ERR wrong number of arguments for '{}' command",
            name
        ));
    }

    let mut groups: HashMap<String, CmdLine> = HashMap::new();
    for pair in cmd_line[1..].chunks(2) {
        let key = String::from_utf8_lossy(&pair[0]).into_owned();
        let node = cluster.pick_node(&key).to_string();
        groups
            .entry(node)
            .or_insert_with(|| vec![cmd_line[0].clone()])
            .extend([pair[0].clone(), pair[1].clone()]);
    }

    if groups.len() == 1 {
        if let Some((node, cmd)) = groups.into_iter().next() {
            return cluster.relay_or_local(session, &node, cmd).await;
        }
        return RespValue::error("ERR no keys");
    }

    match run_tcc(cluster, session, &groups).await {
        Ok(_) if nx => RespValue::Integer(1),
        Ok(_) => RespValue::ok(),
        Err(reply) => reply,
    }
}

/// DEL across nodes. The reply is the total number of keys removed.
pub(crate) async fn exec_del(
    cluster: &Arc<Cluster>,
    session: &mut Session,
    cmd_line: CmdLine,
) -> RespValue {
    if cmd_line.len() < 2 {
        return RespValue::error("ERR wrong number of arguments for 'del' command");
    }

    let mut groups: HashMap<String, CmdLine> = HashMap::new();
    for raw in &cmd_line[1..] {
        let key = String::from_utf8_lossy(raw).into_owned();
        let node = cluster.pick_node(&key).to_string();
        groups
            .entry(node)
            .or_insert_with(|| vec![cmd_line[0].clone()])
            .push(raw.clone());
    }

    if groups.len() == 1 {
        if let Some((node, cmd)) = groups.into_iter().next() {
            return cluster.relay_or_local(session, &node, cmd).await;
        }
        return RespValue::error("ERR no keys");
    }

    match run_tcc(cluster, session, &groups).await {
        Ok(replies) => {
            let mut removed = 0;
            for reply in replies {
                if let RespValue::Integer(n) = reply {
                    removed += n;
                }
            }
            RespValue::Integer(removed)
        }
        Err(reply) => reply,
    }
}

/// MGET across nodes: scatter per owning node, gather preserving argument
/// order. Reads are not transactional.
pub(crate) async fn exec_mget(
    cluster: &Arc<Cluster>,
    session: &mut Session,
    cmd_line: CmdLine,
) -> RespValue {
    if cmd_line.len() < 2 {
        return RespValue::error("ERR wrong number of arguments for 'mget' command");
    }

    let mut groups: HashMap<String, (Vec<usize>, CmdLine)> = HashMap::new();
    for (position, raw) in cmd_line[1..].iter().enumerate() {
        let key = String::from_utf8_lossy(raw).into_owned();
        let node = cluster.pick_node(&key).to_string();
        let (positions, cmd) = groups
            .entry(node)
            .or_insert_with(|| (Vec::new(), vec![cmd_line[0].clone()]));
        positions.push(position);
        cmd.push(raw.clone());
    }

    let mut values = vec![RespValue::Null; cmd_line.len() - 1];
    for (node, (positions, cmd)) in groups {
        let reply = cluster.relay_or_local(session, &node, cmd).await;
        match reply {
            RespValue::Array(items) if items.len() == positions.len() => {
                for (position, item) in positions.into_iter().zip(items) {
                    values[position] = item;
                }
            }
            RespValue::Error(_) => return reply,
            other => {
                return RespValue::error(format!("ERR unexpected MGET reply from {}: {:?}", node, other))
            }
        }
    }
    RespValue::Array(values)
}

/// Prepare every participant, then commit. The first prepare failure — or
/// the first commit failure — rolls every participant back. Participants
/// that already committed cannot be reversed by this protocol; recovering
/// them forward is a higher layer's concern.
async fn run_tcc(
    cluster: &Arc<Cluster>,
    session: &mut Session,
    groups: &HashMap<String, CmdLine>,
) -> Result<Vec<RespValue>, RespValue> {
    let tx_id = cluster.next_tx_id();

    for (node, cmd) in groups {
        let mut prepare = Vec::with_capacity(cmd.len() + 2);
        prepare.push(Bytes::from_static(b"PREPARE"));
        prepare.push(Bytes::from(tx_id.clone()));
        prepare.extend(cmd.iter().cloned());
        let reply = cluster.relay_or_local(session, node, prepare).await;
        if reply.is_error() {
            request_rollback(cluster, session, &tx_id, groups).await;
            return Err(reply);
        }
    }

    let mut replies = Vec::with_capacity(groups.len());
    for node in groups.keys() {
        let commit = resp::to_cmd_line([
            Bytes::from_static(b"COMMIT"),
            Bytes::from(tx_id.clone()),
        ]);
        let reply = cluster.relay_or_local(session, node, commit).await;
        if reply.is_error() {
            request_rollback(cluster, session, &tx_id, groups).await;
            return Err(reply);
        }
        replies.push(reply);
    }
    Ok(replies)
}

/// Best-effort rollback fan-out to every participant.
async fn request_rollback(
    cluster: &Arc<Cluster>,
    session: &mut Session,
    tx_id: &str,
    groups: &HashMap<String, CmdLine>,
) {
    for node in groups.keys() {
        let rollback = resp::to_cmd_line([
            Bytes::from_static(b"ROLLBACK"),
            Bytes::from(tx_id.to_string()),
        ]);
        let reply = cluster.relay_or_local(session, node, rollback).await;
        if reply.is_error() {
            warn!(
                "rollback of tx {} on {} failed: {:?}",
                tx_id, node, reply
            );
        }
    }
}
