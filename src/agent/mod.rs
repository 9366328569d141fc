//! Reconcile agents driving the volume state machines
//!
//! The controller agent handles the pod-launching states of the
//! provisioning machine (worker pods can start anywhere); the node agent on
//! the node a worker landed on handles the states that read `/pav` files,
//! plus the whole staging machine. Each machine instance is owned by
//! exactly one task at a time, keyed by the object the machine lives on.

pub mod provisioning;
pub mod staging;

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Mutex;

use kube::Client;

use crate::error::Error;

/// Run the node agent: the node-side provisioning loop and the staging
/// loop, side by side, until the process exits.
pub async fn run_node_agent(client: Client, node_name: String) -> Result<(), Error> {
    tokio::try_join!(
        provisioning::run(client.clone(), provisioning::Role::Node(node_name.clone())),
        staging::run(client, node_name),
    )?;
    Ok(())
}

/// Latest observed objects plus the set of keys with a live driver task.
///
/// The watcher updates entries and spawns a task per key; the task drains
/// state transitions and exits when nothing changed since it last looked.
/// Generations make that hand-off race-free: a task only deregisters if no
/// update arrived after the generation it inspected.
pub(crate) struct WorkPool<K, V> {
    inner: Mutex<PoolInner<K, V>>,
}

struct PoolInner<K, V> {
    latest: HashMap<K, (V, u64)>,
    active: HashSet<K>,
    generation: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> WorkPool<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                latest: HashMap::new(),
                active: HashSet::new(),
                generation: 0,
            }),
        }
    }

    /// Record a new object version. Returns true if the caller should
    /// spawn a driver task for the key.
    pub fn update(&self, key: K, value: V) -> bool {
        let mut inner = self.inner.lock().expect("pool lock");
        inner.generation += 1;
        let generation = inner.generation;
        inner.latest.insert(key.clone(), (value, generation));
        inner.active.insert(key)
    }

    /// Forget a deleted object.
    pub fn remove(&self, key: &K) {
        self.inner.lock().expect("pool lock").latest.remove(key);
    }

    /// Latest version of an object, if it still exists.
    pub fn get(&self, key: &K) -> Option<(V, u64)> {
        self.inner.lock().expect("pool lock").latest.get(key).cloned()
    }

    /// Try to deregister the task for `key`. Succeeds only if the latest
    /// entry still has `seen_generation` (or is gone); otherwise the task
    /// must keep going.
    pub fn try_finish(&self, key: &K, seen_generation: u64) -> bool {
        let mut inner = self.inner.lock().expect("pool lock");
        match inner.latest.get(key) {
            Some((_, generation)) if *generation != seen_generation => false,
            _ => {
                inner.active.remove(key);
                true
            }
        }
    }

    /// Deregister unconditionally (the object is gone).
    pub fn finish(&self, key: &K) {
        self.inner.lock().expect("pool lock").active.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_first_update_spawns_and_later_ones_do_not() {
        let pool: WorkPool<&str, u32> = WorkPool::new();
        assert!(pool.update("a", 1));
        assert!(!pool.update("a", 2));
        assert!(pool.update("b", 1));
    }

    #[test]
    fn try_finish_fails_when_an_update_raced_in() {
        let pool: WorkPool<&str, u32> = WorkPool::new();
        pool.update("a", 1);
        let (_, generation) = pool.get(&"a").unwrap();

        // an update arrives while the task is deciding to exit
        pool.update("a", 2);
        assert!(!pool.try_finish(&"a", generation));

        let (_, generation) = pool.get(&"a").unwrap();
        assert!(pool.try_finish(&"a", generation));

        // after finishing, a fresh update spawns again
        assert!(pool.update("a", 3));
    }

    #[test]
    fn removed_keys_finish_unconditionally() {
        let pool: WorkPool<&str, u32> = WorkPool::new();
        pool.update("a", 1);
        pool.remove(&"a");
        assert!(pool.get(&"a").is_none());
        assert!(pool.try_finish(&"a", 0));
    }
}
