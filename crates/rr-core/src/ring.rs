//! Consistent hash ring
//!
//! Maps a key to one physical node such that adding a node reshuffles only
//! about 1/N of the keyspace. Each physical node occupies `replicas` virtual
//! positions on the ring.

use std::collections::HashMap;

/// Hash function from bytes to a ring position.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Consistent hash ring over physical node addresses.
pub struct Ring {
    replicas: usize,
    hash_fn: HashFn,
    /// Sorted virtual node positions.
    hashes: Vec<u32>,
    /// Virtual node position to physical node address.
    nodes: HashMap<u32, String>,
}

impl Ring {
    /// Create an empty ring using CRC32/IEEE as the hash function.
    ///
    /// # Panics
    /// Panics if `replicas` is zero.
    pub fn new(replicas: usize) -> Self {
        Self::with_hash_fn(replicas, Box::new(crc32fast::hash))
    }

    /// Create an empty ring with an injected hash function.
    pub fn with_hash_fn(replicas: usize, hash_fn: HashFn) -> Self {
        assert!(replicas > 0, "ring requires at least one replica per node");
        Self {
            replicas,
            hash_fn,
            hashes: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Add physical nodes to the ring. Empty addresses are skipped.
    ///
    /// A hash collision between virtual nodes overwrites the earlier mapping;
    /// collisions are rare and either mapping is a correct owner for the keys
    /// that land there.
    pub fn add_nodes<I, S>(&mut self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for addr in addrs {
            let addr = addr.into();
            if addr.is_empty() {
                continue;
            }
            for i in 0..self.replicas {
                let virtual_key = format!("{}{}", i, addr);
                let hash = (self.hash_fn)(virtual_key.as_bytes());
                self.hashes.push(hash);
                self.nodes.insert(hash, addr.clone());
            }
        }
        self.hashes.sort_unstable();
        self.hashes.dedup();
    }

    /// Pick the node owning `key`, or `None` on an empty ring.
    ///
    /// Keys sharing a `{tag}` hash tag are placed on the same node.
    pub fn pick_node(&self, key: &str) -> Option<&str> {
        if self.is_empty() {
            return None;
        }
        let hash = (self.hash_fn)(partition_key(key).as_bytes());
        // first virtual node clockwise from the key's position
        let idx = match self.hashes.binary_search(&hash) {
            Ok(i) => i,
            Err(i) if i == self.hashes.len() => 0,
            Err(i) => i,
        };
        self.nodes.get(&self.hashes[idx]).map(String::as_str)
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("replicas", &self.replicas)
            .field("virtual_nodes", &self.hashes.len())
            .finish()
    }
}

/// Extract the hash tag from a key: the substring strictly between the first
/// `{` and the first `}` after it. Missing or adjacent braces mean the whole
/// key participates in hashing.
fn partition_key(key: &str) -> &str {
    let Some(beg) = key.find('{') else {
        return key;
    };
    match key[beg + 1..].find('}') {
        Some(0) | None => key,
        Some(len) => &key[beg + 1..beg + 1 + len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(nodes: &[&str]) -> Ring {
        let mut ring = Ring::new(4);
        ring.add_nodes(nodes.iter().copied());
        ring
    }

    #[test]
    fn empty_ring_picks_nothing() {
        let ring = Ring::new(3);
        assert!(ring.is_empty());
        assert_eq!(ring.pick_node("anything"), None);
    }

    #[test]
    fn empty_addresses_are_skipped() {
        let mut ring = Ring::new(3);
        ring.add_nodes(["", ""]);
        assert!(ring.is_empty());
    }

    #[test]
    fn pick_is_stable() {
        let ring = ring_with(&["a:6399", "b:6399", "c:6399"]);
        let first = ring.pick_node("user:1000").unwrap().to_string();
        for _ in 0..16 {
            assert_eq!(ring.pick_node("user:1000"), Some(first.as_str()));
        }
    }

    #[test]
    fn empty_key_lands_somewhere() {
        let ring = ring_with(&["a:6399", "b:6399"]);
        assert!(ring.pick_node("").is_some());
    }

    #[test]
    fn hash_tag_colocates_keys() {
        let ring = ring_with(&["a:6399", "b:6399", "c:6399"]);
        assert_eq!(
            ring.pick_node("{user1}profile"),
            ring.pick_node("{user1}wallet")
        );
        assert_eq!(ring.pick_node("{tag}x"), ring.pick_node("{tag}y"));
    }

    #[test]
    fn partition_key_edge_cases() {
        assert_eq!(partition_key("{user1}profile"), "user1");
        assert_eq!(partition_key("plain"), "plain");
        assert_eq!(partition_key("{}empty"), "{}empty");
        assert_eq!(partition_key("{open"), "{open");
        assert_eq!(partition_key("}a{b"), "}a{b");
        assert_eq!(partition_key("a{b}c{d}"), "b");
    }

    #[test]
    fn adding_a_node_moves_a_minority_of_keys() {
        let mut ring = Ring::new(64);
        ring.add_nodes(["a:6399", "b:6399", "c:6399"]);

        let keys: Vec<String> = (0..2000).map(|i| format!("key:{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.pick_node(k).unwrap().to_string())
            .collect();

        ring.add_nodes(["d:6399"]);
        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(k, owner)| ring.pick_node(k) != Some(owner.as_str()))
            .count();

        // Expected ~1/4 of keys move; allow generous statistical slack.
        assert!(moved > 0, "some keys must move to the new node");
        assert!(
            moved < keys.len() / 2,
            "only a minority should move, moved {}/{}",
            moved,
            keys.len()
        );
    }

    #[test]
    fn injectable_hash_function() {
        // Constant hash: every virtual node collides, last write wins.
        let mut ring = Ring::with_hash_fn(2, Box::new(|_| 7));
        ring.add_nodes(["a:6399", "b:6399"]);
        assert_eq!(ring.pick_node("k"), Some("b:6399"));
    }
}
