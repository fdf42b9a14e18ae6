//! Command handlers and the registry that binds them
//!
//! Every command the engine understands is declared here: its arity, whether
//! it mutates, how its key sets are derived (for locking and undo logs), and
//! optionally the form it takes in the append-only file (EXPIRE is persisted
//! as an absolute PEXPIREAT so replay cannot extend a key's lifetime).

use crate::db::Db;
use crate::entity::{expire_cmd, DataEntity};
use bytes::Bytes;
use resp::{CmdLine, RespValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) type Handler = fn(&Db, &CmdLine) -> RespValue;
pub(crate) type KeysFn = fn(&CmdLine) -> (Vec<String>, Vec<String>);
pub(crate) type AofFormFn = fn(&Db, &CmdLine) -> Option<CmdLine>;

pub(crate) struct CommandSpec {
    pub arity: i32,
    pub write: bool,
    pub handler: Handler,
    pub keys: KeysFn,
    pub aof_form: Option<AofFormFn>,
}

fn spec(arity: i32, write: bool, handler: Handler, keys: KeysFn) -> CommandSpec {
    CommandSpec {
        arity,
        write,
        handler,
        keys,
        aof_form: None,
    }
}

/// Build the command registry. Called once from `Store::new`.
pub(crate) fn registry() -> HashMap<&'static str, CommandSpec> {
    let mut map = HashMap::new();

    map.insert("ping", spec(-1, false, ping, no_keys));
    map.insert("type", spec(2, false, type_of, read_first_key));
    map.insert("keys", spec(2, false, keys_cmd, no_keys));
    map.insert("flushdb", spec(1, true, flushdb, no_keys));

    map.insert("get", spec(2, false, get, read_first_key));
    map.insert("set", spec(3, true, set, write_first_key));
    map.insert("setnx", spec(3, true, setnx, write_first_key));
    map.insert("getset", spec(3, true, getset, write_first_key));
    map.insert("mget", spec(-2, false, mget, read_all_keys));
    map.insert("mset", spec(-3, true, mset, write_pair_keys));
    map.insert("msetnx", spec(-3, true, msetnx, write_pair_keys));
    map.insert("del", spec(-2, true, del, write_all_keys));
    map.insert("exists", spec(-2, false, exists, read_all_keys));

    map.insert(
        "expire",
        CommandSpec {
            arity: 3,
            write: true,
            handler: expire,
            keys: write_first_key,
            aof_form: Some(expire_aof_form),
        },
    );
    map.insert("pexpireat", spec(3, true, pexpireat, write_first_key));
    map.insert("ttl", spec(2, false, ttl, read_first_key));
    map.insert("persist", spec(2, true, persist, write_first_key));

    map.insert("lpush", spec(-3, true, lpush, write_first_key));
    map.insert("rpush", spec(-3, true, rpush, write_first_key));
    map.insert("lrange", spec(4, false, lrange, read_first_key));
    map.insert("llen", spec(2, false, llen, read_first_key));

    map.insert("hset", spec(-4, true, hset, write_first_key));
    map.insert("hget", spec(3, false, hget, read_first_key));
    map.insert("hdel", spec(-3, true, hdel, write_first_key));
    map.insert("hgetall", spec(2, false, hgetall, read_first_key));

    map.insert("sadd", spec(-3, true, sadd, write_first_key));
    map.insert("srem", spec(-3, true, srem, write_first_key));
    map.insert("smembers", spec(2, false, smembers, read_first_key));
    map.insert("scard", spec(2, false, scard, read_first_key));

    map
}

// ---------------------------------------------------------------------------
// key-set derivation

fn no_keys(_: &CmdLine) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

fn write_first_key(args: &CmdLine) -> (Vec<String>, Vec<String>) {
    (keys_at(args, 1, args.len().min(2)), Vec::new())
}

fn read_first_key(args: &CmdLine) -> (Vec<String>, Vec<String>) {
    (Vec::new(), keys_at(args, 1, args.len().min(2)))
}

fn write_all_keys(args: &CmdLine) -> (Vec<String>, Vec<String>) {
    (keys_at(args, 1, args.len()), Vec::new())
}

fn read_all_keys(args: &CmdLine) -> (Vec<String>, Vec<String>) {
    (Vec::new(), keys_at(args, 1, args.len()))
}

/// MSET-shaped argument lists: every odd position is a key.
fn write_pair_keys(args: &CmdLine) -> (Vec<String>, Vec<String>) {
    let keys = args[1..]
        .iter()
        .step_by(2)
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect();
    (keys, Vec::new())
}

fn keys_at(args: &CmdLine, from: usize, to: usize) -> Vec<String> {
    args[from..to]
        .iter()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect()
}

// ---------------------------------------------------------------------------
// shared helpers

fn wrong_type() -> RespValue {
    RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn key_str(raw: &Bytes) -> Result<&str, RespValue> {
    std::str::from_utf8(raw).map_err(|_| RespValue::error("ERR invalid key (not utf-8)"))
}

fn arg_i64(raw: &Bytes) -> Result<i64, RespValue> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespValue::error("ERR value is not an integer or out of range"))
}

// ---------------------------------------------------------------------------
// connection / housekeeping

fn ping(_db: &Db, args: &CmdLine) -> RespValue {
    match args.len() {
        1 => RespValue::SimpleString(Bytes::from_static(b"PONG")),
        2 => RespValue::BulkString(args[1].clone()),
        _ => RespValue::error("ERR wrong number of arguments for 'ping' command"),
    }
}

fn type_of(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(entity) => RespValue::SimpleString(Bytes::from_static(entity.type_name().as_bytes())),
        None => RespValue::SimpleString(Bytes::from_static(b"none")),
    }
}

fn keys_cmd(db: &Db, args: &CmdLine) -> RespValue {
    let pattern = String::from_utf8_lossy(&args[1]).into_owned();
    let keys = db
        .keys()
        .into_iter()
        .filter(|k| glob_match(&pattern, k))
        .map(|k| RespValue::BulkString(Bytes::from(k)))
        .collect();
    RespValue::Array(keys)
}

fn flushdb(db: &Db, _args: &CmdLine) -> RespValue {
    db.clear();
    RespValue::ok()
}

/// Minimal glob: `*` matches any run, `?` matches one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

// ---------------------------------------------------------------------------
// strings

fn get(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(DataEntity::Bytes(value)) => RespValue::BulkString(value),
        Some(_) => wrong_type(),
        None => RespValue::Null,
    }
}

fn set(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    db.put(key.to_string(), DataEntity::Bytes(args[2].clone()));
    RespValue::ok()
}

fn setnx(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    if db.contains(key) {
        return RespValue::Integer(0);
    }
    db.put(key.to_string(), DataEntity::Bytes(args[2].clone()));
    RespValue::Integer(1)
}

fn getset(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let old = match db.get(key) {
        Some(DataEntity::Bytes(value)) => RespValue::BulkString(value),
        Some(_) => return wrong_type(),
        None => RespValue::Null,
    };
    db.put(key.to_string(), DataEntity::Bytes(args[2].clone()));
    old
}

fn mget(db: &Db, args: &CmdLine) -> RespValue {
    let values = args[1..]
        .iter()
        .map(|raw| match std::str::from_utf8(raw) {
            Ok(key) => match db.get(key) {
                Some(DataEntity::Bytes(value)) => RespValue::BulkString(value),
                _ => RespValue::Null,
            },
            Err(_) => RespValue::Null,
        })
        .collect();
    RespValue::Array(values)
}

fn mset(db: &Db, args: &CmdLine) -> RespValue {
    if (args.len() - 1) % 2 != 0 {
        return RespValue::error("ERR wrong number of arguments for 'mset' command");
    }
    for pair in args[1..].chunks(2) {
        let key = match key_str(&pair[0]) {
            Ok(k) => k,
            Err(e) => return e,
        };
        db.put(key.to_string(), DataEntity::Bytes(pair[1].clone()));
    }
    RespValue::ok()
}

fn msetnx(db: &Db, args: &CmdLine) -> RespValue {
    if (args.len() - 1) % 2 != 0 {
        return RespValue::error("ERR wrong number of arguments for 'msetnx' command");
    }
    let mut pairs = Vec::with_capacity((args.len() - 1) / 2);
    for pair in args[1..].chunks(2) {
        let key = match key_str(&pair[0]) {
            Ok(k) => k,
            Err(e) => return e,
        };
        if db.contains(key) {
            return RespValue::Integer(0);
        }
        pairs.push((key.to_string(), pair[1].clone()));
    }
    for (key, value) in pairs {
        db.put(key, DataEntity::Bytes(value));
    }
    RespValue::Integer(1)
}

fn del(db: &Db, args: &CmdLine) -> RespValue {
    let mut removed = 0;
    for raw in &args[1..] {
        if let Ok(key) = std::str::from_utf8(raw) {
            if db.remove(key) {
                removed += 1;
            }
        }
    }
    RespValue::Integer(removed)
}

fn exists(db: &Db, args: &CmdLine) -> RespValue {
    let mut count = 0;
    for raw in &args[1..] {
        if let Ok(key) = std::str::from_utf8(raw) {
            if db.contains(key) {
                count += 1;
            }
        }
    }
    RespValue::Integer(count)
}

// ---------------------------------------------------------------------------
// expiration

fn expire(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let seconds = match arg_i64(&args[2]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let at = if seconds <= 0 {
        SystemTime::now()
    } else {
        SystemTime::now() + Duration::from_secs(seconds as u64)
    };
    RespValue::Integer(db.set_expire(key, at) as i64)
}

/// EXPIRE reaches the append-only file as the absolute PEXPIREAT it resolved
/// to, so replay at a later wall-clock time cannot extend the key's life.
fn expire_aof_form(db: &Db, args: &CmdLine) -> Option<CmdLine> {
    let key = std::str::from_utf8(&args[1]).ok()?;
    db.get_expire(key).map(|at| expire_cmd(key, at))
}

fn pexpireat(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let ms = match arg_i64(&args[2]) {
        Ok(n) if n >= 0 => n as u64,
        Ok(_) => 0,
        Err(e) => return e,
    };
    let at = UNIX_EPOCH + Duration::from_millis(ms);
    RespValue::Integer(db.set_expire(key, at) as i64)
}

fn ttl(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    if !db.contains(key) {
        return RespValue::Integer(-2);
    }
    match db.get_expire(key) {
        None => RespValue::Integer(-1),
        Some(at) => {
            let remaining = at
                .duration_since(SystemTime::now())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            RespValue::Integer(remaining)
        }
    }
}

fn persist(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    RespValue::Integer(db.persist(key) as i64)
}

// ---------------------------------------------------------------------------
// lists

fn push(db: &Db, args: &CmdLine, front: bool) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let mut list = match db.get(key) {
        Some(DataEntity::List(list)) => list,
        Some(_) => return wrong_type(),
        None => VecDeque::new(),
    };
    for value in &args[2..] {
        if front {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    let len = list.len();
    db.put_keep_expire(key.to_string(), DataEntity::List(list));
    RespValue::Integer(len as i64)
}

fn lpush(db: &Db, args: &CmdLine) -> RespValue {
    push(db, args, true)
}

fn rpush(db: &Db, args: &CmdLine) -> RespValue {
    push(db, args, false)
}

fn lrange(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let (start, stop) = match (arg_i64(&args[2]), arg_i64(&args[3])) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return e,
    };
    let list = match db.get(key) {
        Some(DataEntity::List(list)) => list,
        Some(_) => return wrong_type(),
        None => return RespValue::Array(Vec::new()),
    };
    let items = match normalize_range(list.len(), start, stop) {
        Some((from, to)) => list
            .iter()
            .skip(from)
            .take(to - from + 1)
            .cloned()
            .map(RespValue::BulkString)
            .collect(),
        None => Vec::new(),
    };
    RespValue::Array(items)
}

fn llen(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(DataEntity::List(list)) => RespValue::Integer(list.len() as i64),
        Some(_) => wrong_type(),
        None => RespValue::Integer(0),
    }
}

/// Inclusive index range after Redis-style negative-index handling.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let from = if start < 0 { (len + start).max(0) } else { start };
    let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if from >= len || to < from {
        return None;
    }
    Some((from as usize, to as usize))
}

// ---------------------------------------------------------------------------
// hashes

fn hset(db: &Db, args: &CmdLine) -> RespValue {
    if (args.len() - 2) % 2 != 0 {
        return RespValue::error("ERR wrong number of arguments for 'hset' command");
    }
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let mut hash = match db.get(key) {
        Some(DataEntity::Hash(hash)) => hash,
        Some(_) => return wrong_type(),
        None => HashMap::new(),
    };
    let mut added = 0;
    for pair in args[2..].chunks(2) {
        if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
            added += 1;
        }
    }
    db.put_keep_expire(key.to_string(), DataEntity::Hash(hash));
    RespValue::Integer(added)
}

fn hget(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(DataEntity::Hash(hash)) => RespValue::bulk(hash.get(&args[2]).cloned()),
        Some(_) => wrong_type(),
        None => RespValue::Null,
    }
}

fn hdel(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let mut hash = match db.get(key) {
        Some(DataEntity::Hash(hash)) => hash,
        Some(_) => return wrong_type(),
        None => return RespValue::Integer(0),
    };
    let mut removed = 0;
    for field in &args[2..] {
        if hash.remove(field).is_some() {
            removed += 1;
        }
    }
    if hash.is_empty() {
        db.remove(key);
    } else {
        db.put_keep_expire(key.to_string(), DataEntity::Hash(hash));
    }
    RespValue::Integer(removed)
}

fn hgetall(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(DataEntity::Hash(hash)) => {
            let mut items = Vec::with_capacity(hash.len() * 2);
            for (field, value) in hash {
                items.push(RespValue::BulkString(field));
                items.push(RespValue::BulkString(value));
            }
            RespValue::Array(items)
        }
        Some(_) => wrong_type(),
        None => RespValue::Array(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// sets

fn sadd(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let mut set = match db.get(key) {
        Some(DataEntity::Set(set)) => set,
        Some(_) => return wrong_type(),
        None => HashSet::new(),
    };
    let mut added = 0;
    for member in &args[2..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    db.put_keep_expire(key.to_string(), DataEntity::Set(set));
    RespValue::Integer(added)
}

fn srem(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let mut set = match db.get(key) {
        Some(DataEntity::Set(set)) => set,
        Some(_) => return wrong_type(),
        None => return RespValue::Integer(0),
    };
    let mut removed = 0;
    for member in &args[2..] {
        if set.remove(member) {
            removed += 1;
        }
    }
    if set.is_empty() {
        db.remove(key);
    } else {
        db.put_keep_expire(key.to_string(), DataEntity::Set(set));
    }
    RespValue::Integer(removed)
}

fn smembers(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(DataEntity::Set(set)) => {
            RespValue::Array(set.into_iter().map(RespValue::BulkString).collect())
        }
        Some(_) => wrong_type(),
        None => RespValue::Array(Vec::new()),
    }
}

fn scard(db: &Db, args: &CmdLine) -> RespValue {
    let key = match key_str(&args[1]) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match db.get(key) {
        Some(DataEntity::Set(set)) => RespValue::Integer(set.len() as i64),
        Some(_) => wrong_type(),
        None => RespValue::Integer(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resp::to_cmd_line;

    fn run(db: &Db, parts: &[&str]) -> RespValue {
        let cmd = to_cmd_line(parts.iter().map(|s| s.to_string()));
        let handler = registry()
            .get(parts[0].to_ascii_lowercase().as_str())
            .expect("registered command")
            .handler;
        handler(db, &cmd)
    }

    #[test]
    fn list_push_and_range() {
        let db = Db::new();
        assert_eq!(run(&db, &["RPUSH", "l", "a", "b", "c"]), RespValue::Integer(3));
        assert_eq!(run(&db, &["LPUSH", "l", "z"]), RespValue::Integer(4));
        let range = run(&db, &["LRANGE", "l", "0", "-1"]);
        assert_eq!(
            range,
            RespValue::Array(
                ["z", "a", "b", "c"]
                    .into_iter()
                    .map(|s| RespValue::BulkString(Bytes::from(s)))
                    .collect()
            )
        );
        assert_eq!(run(&db, &["LRANGE", "l", "5", "9"]), RespValue::Array(vec![]));
    }

    #[test]
    fn wrong_type_is_reported() {
        let db = Db::new();
        run(&db, &["SET", "k", "v"]);
        assert!(run(&db, &["LPUSH", "k", "x"]).is_error());
        assert!(run(&db, &["HGET", "k", "f"]).is_error());
        assert!(run(&db, &["SADD", "k", "m"]).is_error());
    }

    #[test]
    fn hash_set_get_del() {
        let db = Db::new();
        assert_eq!(
            run(&db, &["HSET", "h", "f1", "v1", "f2", "v2"]),
            RespValue::Integer(2)
        );
        assert_eq!(
            run(&db, &["HSET", "h", "f1", "v1b"]),
            RespValue::Integer(0),
            "overwriting a field adds nothing"
        );
        assert_eq!(
            run(&db, &["HGET", "h", "f1"]),
            RespValue::BulkString(Bytes::from("v1b"))
        );
        assert_eq!(run(&db, &["HDEL", "h", "f1", "f2"]), RespValue::Integer(2));
        assert_eq!(run(&db, &["HGET", "h", "f1"]), RespValue::Null);
    }

    #[test]
    fn set_membership() {
        let db = Db::new();
        assert_eq!(run(&db, &["SADD", "s", "a", "b", "a"]), RespValue::Integer(2));
        assert_eq!(run(&db, &["SCARD", "s"]), RespValue::Integer(2));
        assert_eq!(run(&db, &["SREM", "s", "a", "x"]), RespValue::Integer(1));
    }

    #[test]
    fn msetnx_is_all_or_nothing() {
        let db = Db::new();
        run(&db, &["SET", "k2", "existing"]);
        assert_eq!(
            run(&db, &["MSETNX", "k1", "a", "k2", "b"]),
            RespValue::Integer(0)
        );
        assert_eq!(run(&db, &["GET", "k1"]), RespValue::Null);
        assert_eq!(
            run(&db, &["MSETNX", "k1", "a", "k3", "b"]),
            RespValue::Integer(1)
        );
        assert_eq!(run(&db, &["GET", "k1"]), RespValue::BulkString(Bytes::from("a")));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("user:*", "user:42"));
        assert!(glob_match("k?y", "key"));
        assert!(!glob_match("user:*", "session:42"));
        assert!(glob_match("", ""));
    }

    #[test]
    fn pair_key_extraction() {
        let cmd = to_cmd_line(["MSET", "k1", "v1", "k2", "v2"]);
        let (write, read) = write_pair_keys(&cmd);
        assert_eq!(write, vec!["k1".to_string(), "k2".to_string()]);
        assert!(read.is_empty());
    }
}
