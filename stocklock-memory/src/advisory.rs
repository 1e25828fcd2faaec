use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stocklock_types::{AdvisoryLockService, AdvisorySession, LockError, LockKey};
use tokio::sync::{Mutex as NamedLock, OwnedMutexGuard};

type Registry = Arc<Mutex<HashMap<LockKey, Arc<NamedLock<()>>>>>;

/// In-process named locks with session scoping.
///
/// Locks are held by the session that took them and are released when the
/// session unlocks them or is dropped.
#[derive(Clone, Default)]
pub struct InMemoryAdvisoryLocks {
    registry: Registry,
}

impl InMemoryAdvisoryLocks {
    /// Create a lock service with no locks held
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys some session holds or is waiting for.
    pub fn tracked_keys(&self) -> usize {
        let mut registry = self.registry.lock().expect("Mutex poisoned");
        prune(&mut registry);
        registry.len()
    }
}

impl AdvisoryLockService for InMemoryAdvisoryLocks {
    type Session = InMemoryAdvisorySession;

    async fn obtain_session(&self) -> Result<InMemoryAdvisorySession, LockError> {
        Ok(InMemoryAdvisorySession {
            registry: Arc::clone(&self.registry),
            held: HashMap::new(),
        })
    }
}

/// Session obtained from [`InMemoryAdvisoryLocks`].
pub struct InMemoryAdvisorySession {
    registry: Registry,
    held: HashMap<LockKey, OwnedMutexGuard<()>>,
}

impl InMemoryAdvisorySession {
    fn named(&self, key: &LockKey) -> Arc<NamedLock<()>> {
        let mut registry = self.registry.lock().expect("Mutex poisoned");
        Arc::clone(registry.entry(key.clone()).or_default())
    }

    fn forget_unused(&self) {
        prune(&mut self.registry.lock().expect("Mutex poisoned"));
    }
}

/// Drop named locks that no session holds or waits for.
fn prune(registry: &mut HashMap<LockKey, Arc<NamedLock<()>>>) {
    registry.retain(|_, named| Arc::strong_count(named) > 1);
}

impl AdvisorySession for InMemoryAdvisorySession {
    async fn lock(&mut self, key: &LockKey, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.held.contains_key(key) {
            return Ok(());
        }

        let named = self.named(key);
        let guard = match timeout {
            Some(limit) => tokio::time::timeout(limit, named.lock_owned()).await.ok(),
            None => Some(named.lock_owned().await),
        };

        let Some(guard) = guard else {
            self.forget_unused();
            return Err(LockError::AcquisitionTimeout {
                key: key.clone(),
                waited: timeout.unwrap_or_default(),
            });
        };

        self.held.insert(key.clone(), guard);
        Ok(())
    }

    async fn try_lock(&mut self, key: &LockKey) -> Result<bool, LockError> {
        if self.held.contains_key(key) {
            return Ok(true);
        }

        match self.named(key).try_lock_owned() {
            Ok(guard) => {
                self.held.insert(key.clone(), guard);
                Ok(true)
            }
            Err(_) => {
                self.forget_unused();
                Ok(false)
            }
        }
    }

    async fn unlock(&mut self, key: &LockKey) -> Result<(), LockError> {
        let guard = self
            .held
            .remove(key)
            .ok_or_else(|| LockError::NotHeld { key: key.clone() })?;
        drop(guard);
        self.forget_unused();
        Ok(())
    }
}

impl Drop for InMemoryAdvisorySession {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            self.held.clear();
            self.forget_unused();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LockKey {
        LockKey::try_new("stock:1").expect("valid key")
    }

    #[tokio::test]
    async fn sessions_exclude_each_other() {
        let service = InMemoryAdvisoryLocks::new();
        let mut first = service.obtain_session().await.expect("session");
        let mut second = service.obtain_session().await.expect("session");

        first.lock(&key(), None).await.expect("lock");

        assert_eq!(second.try_lock(&key()).await, Ok(false));
        first.unlock(&key()).await.expect("unlock");
        assert_eq!(second.try_lock(&key()).await, Ok(true));
    }

    #[tokio::test]
    async fn unlocking_a_lock_not_held_reports_not_held() {
        let service = InMemoryAdvisoryLocks::new();
        let mut session = service.obtain_session().await.expect("session");

        assert_eq!(
            session.unlock(&key()).await,
            Err(LockError::NotHeld { key: key() })
        );
    }

    #[tokio::test]
    async fn lock_with_timeout_gives_up() {
        let service = InMemoryAdvisoryLocks::new();
        let mut holder = service.obtain_session().await.expect("session");
        let mut waiter = service.obtain_session().await.expect("session");
        holder.lock(&key(), None).await.expect("lock");

        let result = waiter.lock(&key(), Some(Duration::from_millis(20))).await;

        assert!(matches!(
            result,
            Err(LockError::AcquisitionTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn dropping_a_session_releases_its_locks() {
        let service = InMemoryAdvisoryLocks::new();
        let mut holder = service.obtain_session().await.expect("session");
        holder.lock(&key(), None).await.expect("lock");

        drop(holder);

        let mut next = service.obtain_session().await.expect("session");
        assert_eq!(next.try_lock(&key()).await, Ok(true));
    }

    #[tokio::test]
    async fn released_names_are_forgotten() {
        // Given: one name unlocked, one dropped with its session, one timed out
        let service = InMemoryAdvisoryLocks::new();
        let other = LockKey::try_new("stock:2").expect("valid key");
        let mut first = service.obtain_session().await.expect("session");
        let mut second = service.obtain_session().await.expect("session");
        first.lock(&key(), None).await.expect("lock");
        second.lock(&other, None).await.expect("lock");
        let timed_out = second.lock(&key(), Some(Duration::from_millis(10))).await;
        assert!(timed_out.is_err());
        assert_eq!(service.tracked_keys(), 2);

        // When: the holders let go
        first.unlock(&key()).await.expect("unlock");
        drop(second);

        // Then: the registry is empty again
        assert_eq!(service.tracked_keys(), 0);
    }
}
