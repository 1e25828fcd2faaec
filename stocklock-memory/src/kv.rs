use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stocklock_types::{KeyValueService, LockError, ReleaseSubscription};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// In-process key-value service with expiring entries and pub/sub.
///
/// Expiry is checked lazily on every access, so an expired entry behaves as
/// absent even if nothing has touched the map since it lapsed.
#[derive(Clone, Default)]
pub struct InMemoryKeyValue {
    shared: Arc<Shared>,
}

impl InMemoryKeyValue {
    /// Create a new empty key-value service
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let entries = self.shared.entries.lock().expect("Mutex poisoned");
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of channels with at least one live subscription.
    pub fn channel_count(&self) -> usize {
        let mut channels = self.shared.channels.lock().expect("Mutex poisoned");
        prune_channels(&mut channels);
        channels.len()
    }

    fn with_live_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.shared.entries.lock().expect("Mutex poisoned");
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries)
    }
}

impl KeyValueService for InMemoryKeyValue {
    type Subscription = InMemorySubscription;

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.with_live_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now().checked_add(ttl),
                },
            );
            true
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.with_live_entries(|entries| entries.remove(key).is_some()))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        Ok(self.with_live_entries(|entries| {
            if entries.get(key).is_some_and(|entry| entry.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        }))
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, LockError> {
        let now = Instant::now();
        Ok(self.with_live_entries(|entries| {
            entries.get(key).map(|entry| {
                entry
                    .expires_at
                    .map_or(Duration::MAX, |expires_at| expires_at.duration_since(now))
            })
        }))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), LockError> {
        let mut channels = self.shared.channels.lock().expect("Mutex poisoned");
        prune_channels(&mut channels);
        if let Some(sender) = channels.get(channel) {
            // No receivers is not an error: nobody is waiting.
            let delivered = sender.send(message.to_string()).unwrap_or(0);
            trace!(channel, delivered, "[memory.published] release announced");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<InMemorySubscription, LockError> {
        let mut channels = self.shared.channels.lock().expect("Mutex poisoned");
        prune_channels(&mut channels);
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(InMemorySubscription {
            receiver: sender.subscribe(),
        })
    }
}

/// Channels whose subscribers have all gone are dropped.
fn prune_channels(channels: &mut HashMap<String, broadcast::Sender<String>>) {
    channels.retain(|_, sender| sender.receiver_count() > 0);
}

/// Subscription to an [`InMemoryKeyValue`] channel.
pub struct InMemorySubscription {
    receiver: broadcast::Receiver<String>,
}

impl ReleaseSubscription for InMemorySubscription {
    async fn next_message(&mut self) -> Result<Option<String>, LockError> {
        match self.receiver.recv().await {
            Ok(message) => Ok(Some(message)),
            // Missed messages still mean something was released.
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(Some(String::new())),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }
}
