//! Per-node mutual exclusion between threads of this process.
//!
//! This is unrelated to the advisory document lock stored on a document
//! (`LockInfo`): a token only serializes concurrent writers for the length
//! of one critical section.

use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::NodeId;

/// Shared synchronization handle for one node.
pub type LockToken = Arc<Mutex<()>>;

/// Held token; released on drop.
pub type NodeGuard = parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>;

#[derive(Default)]
pub struct LockCoordinator {
    tokens: Mutex<HashMap<NodeId, LockToken>>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `id`, created on first use and kept for the coordinator's
    /// lifetime.
    pub fn token_for(&self, id: NodeId) -> LockToken {
        self.tokens
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Block until the token for `id` is free and hold it.
    pub fn acquire(&self, id: NodeId) -> NodeGuard {
        let token = self.token_for(id);
        token.lock_arc()
    }

    /// Hold several tokens at once. Ids are deduplicated and taken in
    /// ascending order so two callers can never wait on each other.
    pub fn acquire_all(&self, ids: &[NodeId]) -> Vec<NodeGuard> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| self.acquire(id)).collect()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn same_id_yields_same_token() {
        let coordinator = LockCoordinator::new();
        let id = Uuid::new_v4();
        let a = coordinator.token_for(id);
        let b = coordinator.token_for(id);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &coordinator.token_for(Uuid::new_v4())));
        assert_eq!(coordinator.token_count(), 2);
    }

    #[test]
    fn guard_excludes_other_threads() {
        let coordinator = Arc::new(LockCoordinator::new());
        let id = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = coordinator.acquire(id);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acquire_all_dedups_and_orders() {
        let coordinator = LockCoordinator::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let guards = coordinator.acquire_all(&[b, a, b]);
        assert_eq!(guards.len(), 2);
        assert!(coordinator.token_for(a).is_locked());
        drop(guards);
        assert!(!coordinator.token_for(a).is_locked());
    }

    #[test]
    fn opposite_order_callers_do_not_deadlock() {
        let coordinator = Arc::new(LockCoordinator::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c1 = coordinator.clone();
        let t1 = thread::spawn(move || {
            for _ in 0..200 {
                let _g = c1.acquire_all(&[a, b]);
            }
        });
        let c2 = coordinator.clone();
        let t2 = thread::spawn(move || {
            for _ in 0..200 {
                let _g = c2.acquire_all(&[b, a]);
            }
        });
        t1.join().unwrap();
        t2.join().unwrap();
    }
}
