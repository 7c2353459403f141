//! Hash collections that switch between gxhash and std hashing
//!
//! The `gxhash` feature (on by default) needs AES-NI/SSE2 or NEON. Building
//! without it falls back to std's SipHash so the crate still works on other
//! CPUs.
//!
//! Besides the single-threaded [`HashMap`], this module names the concurrent
//! map and set types shared by worker tasks: base-archive claims, the inode
//! registry of a create run and the hardlink table of an extract run.

use dashmap::{DashMap, DashSet};
use std::hash::Hash;

#[cfg(feature = "gxhash")]
pub use gxhash::{GxBuildHasher, HashMap as GxHashMap, HashMapExt};

#[cfg(not(feature = "gxhash"))]
use std::collections::HashMap as StdHashMap;

/// Type alias for HashMap that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashMap<K, V> = GxHashMap<K, V>;

/// Type alias for HashMap that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashMap<K, V> = StdHashMap<K, V>;

/// Extension trait for creating HashMap instances
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates a new HashMap with default capacity
    fn new() -> Self;

    /// Creates a new HashMap with specified capacity
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for StdHashMap<K, V> {
    fn new() -> Self {
        StdHashMap::new()
    }

    fn with_capacity(capacity: usize) -> Self {
        StdHashMap::with_capacity(capacity)
    }
}

/// Hasher type that uses GxBuildHasher when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::hash::RandomState;

/// Sharded map safe to share between worker tasks
pub type ConcurrentMap<K, V> = DashMap<K, V, GxBuildHasher>;

/// Sharded set safe to share between worker tasks
pub type ConcurrentSet<K> = DashSet<K, GxBuildHasher>;

/// Empty [`ConcurrentMap`]
pub fn concurrent_map<K: Eq + Hash, V>() -> ConcurrentMap<K, V> {
    DashMap::with_hasher(GxBuildHasher::default())
}

/// Empty [`ConcurrentSet`]
pub fn concurrent_set<K: Eq + Hash>() -> ConcurrentSet<K> {
    DashSet::with_hasher(GxBuildHasher::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_set_insert_once() {
        let set = concurrent_set::<i64>();
        assert!(set.insert(4));
        assert!(!set.insert(4));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_hash_map_ext() {
        let mut map: HashMap<String, u32> = HashMap::new();
        map.insert("a".into(), 1);
        assert_eq!(map.get("a"), Some(&1));
    }
}
