//! Advisory, document-backed mutex shared by all workers of a run.
//!
//! Each contended resource is represented by one `{resourceName, locked}`
//! document. Acquisition is a single conditional update, so at most one caller
//! can flip `locked` from `false` to `true`. The lock is not reentrant, not
//! fair, and any caller may unlock; callers unlock only what they acquired.

use std::sync::Arc;

use serde_json::json;

use crate::error::{DUPLICATE_KEY, StoreError};
use crate::store::{Connection, doc};

/// Default collection holding the mutex documents.
pub const DEFAULT_MUTEX_COLLECTION: &str = "fsm_mutexes";

#[derive(Clone)]
pub struct MutexCoordinator {
    conn: Arc<dyn Connection>,
    collection: String,
}

impl MutexCoordinator {
    pub fn new(conn: Arc<dyn Connection>, collection: impl Into<String>) -> Self {
        Self {
            conn,
            collection: collection.into(),
        }
    }

    /// Creates the unlocked record for `resource`. Typically called from setup.
    ///
    /// The record is keyed by `_id`, so provisioning an existing resource is a
    /// no-op and leaves its current lock state alone.
    pub fn provision(&self, resource: &str) -> Result<(), StoreError> {
        let record = doc(json!({ "_id": resource, "resourceName": resource, "locked": false }));
        match self.conn.insert(&self.collection, record) {
            Err(e) if e.code == DUPLICATE_KEY => {
                tracing::debug!(resource, "mutex record already provisioned");
                Ok(())
            }
            other => other,
        }
    }

    /// Deletes the record for `resource`. Typically called from teardown.
    pub fn remove(&self, resource: &str) -> Result<(), StoreError> {
        self.conn
            .delete(&self.collection, &doc(json!({ "resourceName": resource })))
            .map(|_| ())
    }

    /// Returns true iff this call flipped the record from unlocked to locked.
    /// A resource with no record yields `false`.
    pub fn try_lock(&self, resource: &str) -> Result<bool, StoreError> {
        let result = self.conn.update(
            &self.collection,
            &doc(json!({ "resourceName": resource, "locked": false })),
            &doc(json!({ "locked": true })),
            false,
        )?;
        Ok(result.modified == 1)
    }

    pub fn unlock(&self, resource: &str) -> Result<(), StoreError> {
        self.conn
            .update(
                &self.collection,
                &doc(json!({ "resourceName": resource })),
                &doc(json!({ "locked": false })),
                false,
            )
            .map(|_| ())
    }

    /// Like [`try_lock`](Self::try_lock), returning a guard that unlocks on drop.
    pub fn try_acquire(&self, resource: &str) -> Result<Option<MutexGuard<'_>>, StoreError> {
        if self.try_lock(resource)? {
            Ok(Some(MutexGuard {
                coordinator: self,
                resource: resource.to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

/// Held lock on one resource. Dropping it unlocks the resource.
pub struct MutexGuard<'a> {
    coordinator: &'a MutexCoordinator,
    resource: String,
}

impl MutexGuard<'_> {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.coordinator.unlock(&self.resource) {
            tracing::warn!(resource = %self.resource, error = %e, "failed to release mutex");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HOST_UNREACHABLE;
    use crate::store::MemoryStore;
    use std::sync::Barrier;

    fn coordinator() -> (Arc<MemoryStore>, MutexCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let mutex = MutexCoordinator::new(store.clone(), DEFAULT_MUTEX_COLLECTION);
        (store, mutex)
    }

    #[test]
    fn lock_is_exclusive_until_unlocked() {
        let (_, mutex) = coordinator();
        mutex.provision("x").unwrap();

        assert!(mutex.try_lock("x").unwrap());
        assert!(!mutex.try_lock("x").unwrap());
        mutex.unlock("x").unwrap();
        assert!(mutex.try_lock("x").unwrap());
    }

    #[test]
    fn unprovisioned_resource_is_not_lockable() {
        let (_, mutex) = coordinator();
        assert!(!mutex.try_lock("missing").unwrap());
    }

    #[test]
    fn unlock_then_lock_round_trip() {
        let (_, mutex) = coordinator();
        mutex.provision("r").unwrap();
        for _ in 0..5 {
            mutex.unlock("r").unwrap();
            assert!(mutex.try_lock("r").unwrap());
        }
    }

    #[test]
    fn concurrent_try_lock_has_single_winner() {
        let (_, mutex) = coordinator();
        mutex.provision("x").unwrap();

        let n = 16;
        let barrier = Barrier::new(n);
        let winners = std::thread::scope(|s| {
            let handles: Vec<_> = (0..n)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        mutex.try_lock("x").unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let (_, mutex) = coordinator();
        mutex.provision("g").unwrap();
        {
            let guard = mutex.try_acquire("g").unwrap().expect("lock should be free");
            assert_eq!(guard.resource(), "g");
            assert!(mutex.try_acquire("g").unwrap().is_none());
        }
        assert!(mutex.try_lock("g").unwrap());
    }

    #[test]
    fn remove_deletes_record() {
        let (_, mutex) = coordinator();
        mutex.provision("x").unwrap();
        mutex.remove("x").unwrap();
        assert!(!mutex.try_lock("x").unwrap());
    }

    #[test]
    fn provisioning_twice_keeps_one_record() {
        let (store, mutex) = coordinator();
        mutex.provision("x").unwrap();
        mutex.provision("x").unwrap();

        let records = store
            .find(DEFAULT_MUTEX_COLLECTION, &doc(json!({ "resourceName": "x" })))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(mutex.try_lock("x").unwrap());
        assert!(!mutex.try_lock("x").unwrap());
    }

    #[test]
    fn reprovisioning_does_not_release_a_held_lock() {
        let (_, mutex) = coordinator();
        mutex.provision("x").unwrap();
        assert!(mutex.try_lock("x").unwrap());
        mutex.provision("x").unwrap();
        assert!(!mutex.try_lock("x").unwrap());
    }

    #[test]
    fn store_failure_propagates() {
        let (store, mutex) = coordinator();
        mutex.provision("x").unwrap();
        store.set_available(false);
        let err = mutex.try_lock("x").unwrap_err();
        assert_eq!(err.code, HOST_UNREACHABLE);
    }
}
