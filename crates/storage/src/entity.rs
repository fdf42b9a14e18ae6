//! Typed values stored under a key

use bytes::Bytes;
use resp::{to_cmd_line, CmdLine};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

/// A value bound to a key.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEntity {
    Bytes(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    Set(HashSet<Bytes>),
}

impl DataEntity {
    pub fn type_name(&self) -> &'static str {
        match self {
            DataEntity::Bytes(_) => "string",
            DataEntity::List(_) => "list",
            DataEntity::Hash(_) => "hash",
            DataEntity::Set(_) => "set",
        }
    }
}

/// The one canonical command that recreates `entity` at `key`.
///
/// Used by the rewrite pass to dump live state, and by undo-log generation to
/// restore an overwritten value.
pub fn entity_to_cmd(key: &str, entity: &DataEntity) -> Option<CmdLine> {
    let key = Bytes::copy_from_slice(key.as_bytes());
    let cmd = match entity {
        DataEntity::Bytes(value) => {
            vec![Bytes::from_static(b"SET"), key, value.clone()]
        }
        DataEntity::List(items) => {
            let mut cmd = Vec::with_capacity(items.len() + 2);
            cmd.push(Bytes::from_static(b"RPUSH"));
            cmd.push(key);
            cmd.extend(items.iter().cloned());
            cmd
        }
        DataEntity::Hash(fields) => {
            let mut cmd = Vec::with_capacity(fields.len() * 2 + 2);
            cmd.push(Bytes::from_static(b"HSET"));
            cmd.push(key);
            for (field, value) in fields {
                cmd.push(field.clone());
                cmd.push(value.clone());
            }
            cmd
        }
        DataEntity::Set(members) => {
            let mut cmd = Vec::with_capacity(members.len() + 2);
            cmd.push(Bytes::from_static(b"SADD"));
            cmd.push(key);
            cmd.extend(members.iter().cloned());
            cmd
        }
    };
    Some(cmd)
}

/// `PEXPIREAT key <unix-ms>` recreating an absolute expiration.
pub fn expire_cmd(key: &str, at: SystemTime) -> CmdLine {
    let ms = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    to_cmd_line([
        Bytes::from_static(b"PEXPIREAT"),
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::from(ms.to_string()),
    ])
}
