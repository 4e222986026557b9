//! Named resource locks.
//!
//! Commands declare the game-state resources they touch. Commands with
//! disjoint resource sets run concurrently; commands sharing a resource run
//! one after another, in the order the lock was granted.
//!
//! Every caller acquires its resources in ascending [`ResourceId`] order, so
//! two overlapping requests can never wait on each other in a cycle.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use turnstile_domain::ResourceId;

/// Lock table for one session.
#[derive(Default)]
pub struct ResourceLocks {
    locks: DashMap<ResourceId, Arc<Mutex<()>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `critical_section` while holding every lock in `resources`.
    ///
    /// Acquisition never fails, it only waits. Locks are released when the
    /// critical section finishes, fails, panics or is dropped.
    pub async fn use_locks<F, Fut, T>(
        &self,
        resources: &BTreeSet<ResourceId>,
        critical_section: F,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guards = self.acquire(resources).await;
        let result = critical_section().await;
        drop(guards);
        self.prune(resources);
        result
    }

    async fn acquire(&self, resources: &BTreeSet<ResourceId>) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(resources.len());
        for resource in resources {
            // Clone the mutex out before awaiting so no shard lock is held while waiting
            let lock = Arc::clone(&self.locks.entry(resource.clone()).or_default());
            guards.push(lock.lock_owned().await);
            tracing::trace!(resource = %resource, "Resource lock acquired");
        }
        guards
    }

    /// Drop table entries nobody holds or waits for.
    fn prune(&self, resources: &BTreeSet<ResourceId>) {
        for resource in resources {
            self.locks
                .remove_if(resource, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    /// Number of resources currently present in the lock table.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
