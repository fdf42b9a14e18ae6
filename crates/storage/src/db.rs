//! One logical database: a keyspace with optional per-key expirations

use crate::entity::DataEntity;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

struct Entry {
    entity: DataEntity,
    expire_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expire_at.is_some_and(|at| SystemTime::now() >= at)
    }
}

/// One logical database. Expired keys are evicted lazily on access.
#[derive(Default)]
pub struct Db {
    data: RwLock<HashMap<String, Entry>>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live entity under `key`, evicting it first if expired.
    pub fn get(&self, key: &str) -> Option<DataEntity> {
        let mut data = self.data.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                None
            }
            Some(entry) => Some(entry.entity.clone()),
            None => None,
        }
    }

    /// Get the live entity and its expiration in one step (undo-log capture).
    pub fn get_with_expire(&self, key: &str) -> Option<(DataEntity, Option<SystemTime>)> {
        let mut data = self.data.write();
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                None
            }
            Some(entry) => Some((entry.entity.clone(), entry.expire_at)),
            None => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace, clearing any previous expiration.
    pub fn put(&self, key: String, entity: DataEntity) {
        self.data.write().insert(
            key,
            Entry {
                entity,
                expire_at: None,
            },
        );
    }

    /// Insert or replace, keeping the key's previous expiration.
    pub fn put_keep_expire(&self, key: String, entity: DataEntity) {
        let mut data = self.data.write();
        let expire_at = match data.get(&key) {
            Some(entry) if !entry.is_expired() => entry.expire_at,
            _ => None,
        };
        data.insert(key, Entry { entity, expire_at });
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut data = self.data.write();
        match data.remove(key) {
            Some(entry) => !entry.is_expired(),
            None => false,
        }
    }

    /// Set an absolute expiration. Returns false when the key is absent.
    pub fn set_expire(&self, key: &str, at: SystemTime) -> bool {
        let mut data = self.data.write();
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expire_at = Some(at);
                true
            }
            _ => false,
        }
    }

    pub fn get_expire(&self, key: &str) -> Option<SystemTime> {
        let data = self.data.read();
        data.get(key).filter(|e| !e.is_expired())?.expire_at
    }

    /// Clear a key's expiration. Returns true when one was removed.
    pub fn persist(&self, key: &str) -> bool {
        let mut data = self.data.write();
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.expire_at.is_some() => {
                entry.expire_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        let data = self.data.read();
        data.values().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }

    pub fn keys(&self) -> Vec<String> {
        let data = self.data.read();
        data.iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Visit every live `(key, entity, expiration)`. The visitor returns
    /// false to stop early. Holds the read lock for the duration.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &DataEntity, Option<SystemTime>) -> bool,
    {
        let data = self.data.read();
        for (key, entry) in data.iter() {
            if entry.is_expired() {
                continue;
            }
            if !visitor(key, &entry.entity, entry.expire_at) {
                break;
            }
        }
    }
}
