//! Hardlink coordination
//!
//! ## Create side
//!
//! [`InodeRegistry`] maps `(device, inode)` to an [`InodeEntry`]. The first
//! name registered for an inode processes the content; names registered
//! later either queue on the entry (first name still running) or copy the
//! finished record at once. When the first name completes it writes one
//! record per queued name under the entry's lock, so no name is lost between
//! queueing and completion.
//!
//! ## Extract side
//!
//! [`HardlinkSyncMap`] maps a descriptor id to a [`Promise`] of the path its
//! first extracted name ended up at. The first record to join becomes the
//! leader and creates the file; every other record waits for the promise and
//! hardlinks to the published path.

use crate::collections::{concurrent_map, ConcurrentMap};
use crate::error::Result;
use crate::live::InodeKey;
use crate::record::ListRecord;
use crate::scheduler::ParkGauge;
use crate::sync::{promise, Promise, Resolver};
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug)]
enum InodeState {
    Pending { waiting: Vec<String> },
    Complete(ListRecord),
}

/// Shared state of one multiply-linked inode during a create run
#[derive(Debug)]
pub struct InodeEntry {
    state: Mutex<InodeState>,
}

impl InodeEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(InodeState::Pending {
                waiting: Vec::new(),
            }),
        }
    }

    /// Record for a later name, or `None` if it was queued on the first
    pub fn follow(&self, name: &str) -> Option<ListRecord> {
        let mut state = self.state.lock();
        match &mut *state {
            InodeState::Complete(record) => Some(record.renamed(name)),
            InodeState::Pending { waiting } => {
                trace!("queueing hardlink {}", name);
                waiting.push(name.to_string());
                None
            }
        }
    }

    /// Mark the first name's record final and emit every queued name via `push`
    pub fn complete(
        &self,
        record: &ListRecord,
        mut push: impl FnMut(&ListRecord) -> Result<()>,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let waiting = match std::mem::replace(&mut *state, InodeState::Complete(record.clone())) {
            InodeState::Pending { waiting } => waiting,
            InodeState::Complete(_) => Vec::new(),
        };
        for name in &waiting {
            push(&record.renamed(name))?;
        }
        Ok(waiting.len())
    }
}

/// Outcome of registering a name with the [`InodeRegistry`]
#[derive(Debug)]
pub enum Registration {
    /// First name seen for the inode; process its content
    First(Arc<InodeEntry>),
    /// Another name already owns the inode
    Follower(Arc<InodeEntry>),
}

/// Inode table of one create run
#[derive(Debug)]
pub struct InodeRegistry {
    inodes: ConcurrentMap<InodeKey, Arc<InodeEntry>>,
}

impl Default for InodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeRegistry {
    pub fn new() -> Self {
        Self {
            inodes: concurrent_map(),
        }
    }

    pub fn register(&self, key: InodeKey) -> Registration {
        match self.inodes.entry(key) {
            Entry::Occupied(entry) => Registration::Follower(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let inode = Arc::new(InodeEntry::new());
                entry.insert(Arc::clone(&inode));
                Registration::First(inode)
            }
        }
    }

    /// Distinct inodes registered
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

/// Role of an extracted record within its hardlink group
pub enum LinkRole {
    /// Create the file, then publish its path
    Leader(Resolver<PathBuf>),
    /// Wait for the leader's path and link to it
    Follower(Promise<PathBuf>),
}

/// Descriptor-id table of one extract run
pub struct HardlinkSyncMap {
    links: ConcurrentMap<i64, Promise<PathBuf>>,
    gauge: ParkGauge,
}

impl HardlinkSyncMap {
    /// Waits register with `gauge`
    pub fn new(gauge: ParkGauge) -> Self {
        Self {
            links: concurrent_map(),
            gauge,
        }
    }

    pub fn join(&self, id: i64) -> LinkRole {
        match self.links.entry(id) {
            Entry::Occupied(entry) => LinkRole::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (resolver, published) = promise(&self.gauge);
                entry.insert(published);
                LinkRole::Leader(resolver)
            }
        }
    }

    /// Groups seen so far
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PhatError;
    use std::thread;

    fn record(name: &str) -> ListRecord {
        ListRecord {
            name: name.into(),
            mode: 0o100644,
            uid: 0,
            gid: 0,
            size: 3,
            mtime_ns: 0,
            acl: None,
            content: None,
            link_target: None,
        }
    }

    #[test]
    fn test_first_then_followers() {
        let registry = InodeRegistry::new();
        let Registration::First(first) = registry.register((1, 10)) else {
            panic!("expected first");
        };
        let Registration::Follower(follower) = registry.register((1, 10)) else {
            panic!("expected follower");
        };
        assert!(follower.follow("/b").is_none());
        assert!(follower.follow("/c").is_none());

        let mut pushed = Vec::new();
        let n = first
            .complete(&record("/a"), |r| {
                pushed.push(r.name.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(pushed, vec!["/b", "/c"]);

        let late = follower.follow("/d").unwrap();
        assert_eq!(late.name, "/d");
        assert_eq!(late.size, 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_inodes_are_independent() {
        let registry = InodeRegistry::new();
        assert!(matches!(registry.register((1, 1)), Registration::First(_)));
        assert!(matches!(registry.register((2, 1)), Registration::First(_)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_followers_receive_leader_path() {
        let map = Arc::new(HardlinkSyncMap::new(ParkGauge::detached()));
        let LinkRole::Leader(resolver) = map.join(7) else {
            panic!("expected leader");
        };
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || match map.join(7) {
                    LinkRole::Follower(p) => p.wait(),
                    LinkRole::Leader(_) => Err(PhatError::internal("second leader")),
                })
            })
            .collect();
        resolver.resolve(PathBuf::from("/restore/a"));
        for w in waiters {
            assert_eq!(w.join().unwrap().unwrap(), PathBuf::from("/restore/a"));
        }
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_failed_leader_cancels_followers() {
        let map = HardlinkSyncMap::new(ParkGauge::detached());
        let leader = map.join(-2);
        let LinkRole::Follower(p) = map.join(-2) else {
            panic!("expected follower");
        };
        drop(leader);
        assert!(matches!(p.wait(), Err(PhatError::Cancelled { .. })));
    }
}
