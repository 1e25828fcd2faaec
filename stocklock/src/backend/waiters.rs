//! Hands each release notification to a single local waiter.
//!
//! A backend keeps at most one subscription per lock key, however many of its
//! callers are waiting on that key. Every message wakes one waiter through
//! [`Notify::notify_one`]; a message that arrives while nobody is parked is
//! kept as a permit for the next waiter, so no release is lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stocklock_types::{KeyValueService, LockError, LockKey, ReleaseSubscription};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Wake {
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Debug)]
struct Channel {
    wake: Arc<Wake>,
    waiters: usize,
    listener: JoinHandle<()>,
}

/// Waiters of one backend, grouped by lock key.
#[derive(Debug, Default)]
pub(super) struct Waiters {
    channels: Mutex<HashMap<LockKey, Channel>>,
}

impl Waiters {
    /// Join the waiters for `key`, subscribing to `channel` if this is the
    /// first one. The subscription is live before this returns.
    pub(super) async fn register<K>(
        self: &Arc<Self>,
        service: &K,
        key: &LockKey,
        channel: &str,
    ) -> Result<Waiter, LockError>
    where
        K: KeyValueService,
        K::Subscription: 'static,
    {
        if let Some(waiter) = self.join(key) {
            return Ok(waiter);
        }

        let subscription = service.subscribe(channel).await?;

        let mut channels = self.channels.lock().expect("Mutex poisoned");
        if let Some(existing) = channels
            .get_mut(key)
            .filter(|existing| !existing.wake.closed.load(Ordering::Acquire))
        {
            // Another caller subscribed meanwhile; ours is dropped.
            existing.waiters += 1;
            return Ok(self.waiter(key, Arc::clone(&existing.wake)));
        }

        let wake = Arc::new(Wake::default());
        let listener = tokio::spawn(listen(key.clone(), subscription, Arc::clone(&wake)));
        if let Some(stale) = channels.insert(
            key.clone(),
            Channel {
                wake: Arc::clone(&wake),
                waiters: 1,
                listener,
            },
        ) {
            stale.listener.abort();
        }

        Ok(self.waiter(key, wake))
    }

    /// Number of keys with a live subscription.
    pub(super) fn subscribed_keys(&self) -> usize {
        self.channels.lock().expect("Mutex poisoned").len()
    }

    fn join(self: &Arc<Self>, key: &LockKey) -> Option<Waiter> {
        let mut channels = self.channels.lock().expect("Mutex poisoned");
        let channel = channels
            .get_mut(key)
            .filter(|channel| !channel.wake.closed.load(Ordering::Acquire))?;
        channel.waiters += 1;
        let wake = Arc::clone(&channel.wake);
        Some(self.waiter(key, wake))
    }

    fn waiter(self: &Arc<Self>, key: &LockKey, wake: Arc<Wake>) -> Waiter {
        Waiter {
            waiters: Arc::clone(self),
            key: key.clone(),
            wake,
        }
    }
}

/// One caller's place among the waiters for a key.
///
/// Dropping the last waiter for a key ends its subscription.
#[derive(Debug)]
pub(super) struct Waiter {
    waiters: Arc<Waiters>,
    key: LockKey,
    wake: Arc<Wake>,
}

impl Waiter {
    /// Wait until a release is handed to this waiter.
    pub(super) async fn notified(&self) {
        self.wake.notify.notified().await;
    }

    /// True once the subscription behind this waiter has ended.
    pub(super) fn is_closed(&self) -> bool {
        self.wake.closed.load(Ordering::Acquire)
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut channels = self.waiters.channels.lock().expect("Mutex poisoned");
        let last = match channels.get_mut(&self.key) {
            Some(channel) if Arc::ptr_eq(&channel.wake, &self.wake) => {
                channel.waiters -= 1;
                channel.waiters == 0
            }
            _ => false,
        };

        if last {
            if let Some(channel) = channels.remove(&self.key) {
                channel.listener.abort();
            }
        }
    }
}

async fn listen<S: ReleaseSubscription>(key: LockKey, mut subscription: S, wake: Arc<Wake>) {
    loop {
        match subscription.next_message().await {
            Ok(Some(_)) => {
                debug!(key = %key, "[blocking_lock.hand_off] waking one waiter");
                wake.notify.notify_one();
            }
            Ok(None) => {
                debug!(key = %key, "[blocking_lock.subscription_closed] release channel closed");
                break;
            }
            Err(error) => {
                warn!(
                    key = %key,
                    error = %error,
                    "[blocking_lock.subscription_failed] release channel failed"
                );
                break;
            }
        }
    }

    // Parked waiters retry and resubscribe; the permit covers one about to park.
    wake.closed.store(true, Ordering::Release);
    wake.notify.notify_waiters();
    wake.notify.notify_one();
}
