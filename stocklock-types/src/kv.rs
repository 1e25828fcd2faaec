use crate::lock::LockError;
use std::future::Future;
use std::time::Duration;

/// Shared key-value service with expiring entries and publish/subscribe.
///
/// Spin and blocking locks are built on these primitives. Every operation is
/// atomic on the service side; in particular `set_if_absent` either creates
/// the entry with its time-to-live or leaves an existing entry untouched.
///
/// Implementations include:
/// - `stocklock-redis`: Redis via `SET NX PX`, Lua compare-and-delete, `PTTL`
///   and pub/sub
/// - `stocklock-memory`: in-process map with lazy expiry and broadcast channels
pub trait KeyValueService: Send + Sync {
    /// Subscription handle returned by [`KeyValueService::subscribe`].
    type Subscription: ReleaseSubscription;

    /// Create `key` with `value` and `ttl` if it does not exist.
    ///
    /// Returns `true` when the entry was created.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Delete `key` regardless of its value. Returns `true` if it existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Delete `key` only while its value still equals `expected`.
    ///
    /// Returns `true` when the entry was deleted.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Remaining time-to-live of `key`.
    ///
    /// `None` when the key does not exist; [`Duration::MAX`] when it exists
    /// without an expiry.
    fn time_to_live(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Duration>, LockError>> + Send;

    /// Publish `message` on `channel`.
    fn publish(
        &self,
        channel: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Subscribe to `channel`. Messages published after this returns are delivered.
    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<Self::Subscription, LockError>> + Send;
}

/// An open subscription to a notification channel.
pub trait ReleaseSubscription: Send {
    /// Wait for the next message. `Ok(None)` once the subscription is closed.
    fn next_message(&mut self) -> impl Future<Output = Result<Option<String>, LockError>> + Send;
}
