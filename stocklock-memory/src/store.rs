use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use stocklock_types::{
    ExpectedVersion, ReadMode, Resource, ResourceId, ResourceStore, StoreError, StoreTransaction,
};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{trace, warn};

#[derive(Default)]
struct Shared {
    // Committed rows keyed by id
    rows: Mutex<HashMap<ResourceId, Resource>>,
    // One async mutex per row, standing in for the database row lock
    row_locks: Mutex<HashMap<ResourceId, Arc<RowLock<()>>>>,
}

impl Shared {
    fn row_lock(&self, id: ResourceId) -> Arc<RowLock<()>> {
        let mut row_locks = self.row_locks.lock().expect("Mutex poisoned");
        Arc::clone(row_locks.entry(id).or_default())
    }

    /// Forget row locks nobody holds or waits for.
    fn prune_row_locks(&self) {
        let mut row_locks = self.row_locks.lock().expect("Mutex poisoned");
        row_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn committed(&self, id: ResourceId) -> Option<Resource> {
        self.rows.lock().expect("Mutex poisoned").get(&id).cloned()
    }
}

/// Thread-safe in-memory resource store for testing.
///
/// Exclusive reads take a per-row async mutex held until the unit of work
/// ends, and committing writes take the same mutex, so the row-lock strategy
/// behaves as it does against PostgreSQL. Plain reads yield to the scheduler
/// after reading, which makes lost updates easy to reproduce when no lock is
/// used.
#[derive(Clone, Default)]
pub struct InMemoryResourceStore {
    shared: Arc<Shared>,
}

impl InMemoryResourceStore {
    /// Create a new empty in-memory resource store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceStore for InMemoryResourceStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            row_guards: HashMap::new(),
            pending: Vec::new(),
        })
    }

    async fn fetch(&self, id: ResourceId) -> Result<Option<Resource>, StoreError> {
        Ok(self.shared.committed(id))
    }

    async fn insert(&self, resource: Resource) -> Result<(), StoreError> {
        self.shared
            .rows
            .lock()
            .expect("Mutex poisoned")
            .insert(resource.id(), resource);
        Ok(())
    }
}

/// Unit of work against an [`InMemoryResourceStore`].
///
/// Writes are buffered and applied atomically on commit. Dropping the
/// transaction discards them and releases its row locks.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    row_guards: HashMap<ResourceId, OwnedMutexGuard<()>>,
    pending: Vec<(Resource, ExpectedVersion)>,
}

impl StoreTransaction for InMemoryTransaction {
    async fn read(
        &mut self,
        id: ResourceId,
        mode: ReadMode,
    ) -> Result<Option<Resource>, StoreError> {
        if mode == ReadMode::Exclusive && !self.row_guards.contains_key(&id) {
            let guard = self.shared.row_lock(id).lock_owned().await;
            trace!(resource_id = %id, "[memory.row_locked] exclusive read granted");
            self.row_guards.insert(id, guard);
            return Ok(self.shared.committed(id));
        }

        let snapshot = self.shared.committed(id);
        tokio::task::yield_now().await;
        Ok(snapshot)
    }

    async fn write(
        &mut self,
        resource: &Resource,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        self.pending.push((resource.clone(), expected));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        // Writes block on row locks held by other units of work.
        let ids: HashSet<ResourceId> = self.pending.iter().map(|(r, _)| r.id()).collect();
        for id in ids {
            if !self.row_guards.contains_key(&id) {
                let guard = self.shared.row_lock(id).lock_owned().await;
                self.row_guards.insert(id, guard);
            }
        }

        let mut rows = self.shared.rows.lock().expect("Mutex poisoned");

        for (resource, expected) in &self.pending {
            let current = rows.get(&resource.id()).ok_or(StoreError::NotFound {
                resource_id: resource.id(),
            })?;
            if let ExpectedVersion::Exact(version) = expected {
                if current.version() != *version {
                    warn!(
                        resource_id = %resource.id(),
                        expected = %version,
                        actual = %current.version(),
                        "[memory.version_conflict] optimistic concurrency check failed"
                    );
                    return Err(StoreError::VersionConflict {
                        resource_id: resource.id(),
                    });
                }
            }
        }

        for (resource, _) in self.pending.drain(..) {
            if let Some(current) = rows.get_mut(&resource.id()) {
                *current = Resource::restore(
                    resource.id(),
                    resource.product_id(),
                    resource.quantity(),
                    current.version().increment(),
                );
            }
        }

        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.row_guards.is_empty() {
            self.row_guards.clear();
            self.shared.prune_row_locks();
        }
    }
}
