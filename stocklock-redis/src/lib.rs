//! Redis implementation of the `StockLock` key-value service.
//!
//! Backs the spin and blocking distributed locks: `SET NX PX` for
//! acquisition, an owner-checked Lua delete for release, `PTTL` for the
//! holder's remaining lease and `PUBLISH`/`SUBSCRIBE` for release
//! notifications.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use redis::{Client, Msg, Script, aio::ConnectionManager};
use stocklock_types::{KeyValueService, LockError, LockOperation, ReleaseSubscription};
use thiserror::Error;
use tracing::{error, instrument, trace};

/// Deletes the key only while it still holds the caller's owner token.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Error)]
pub enum RedisKeyValueError {
    #[error("invalid redis connection url")]
    InvalidUrl(#[source] redis::RedisError),

    #[error("failed to connect to redis")]
    ConnectionFailed(#[source] redis::RedisError),
}

/// Key-value service over a Redis server.
///
/// Commands share one auto-reconnecting [`ConnectionManager`]. Every
/// subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisKeyValue {
    client: Client,
    manager: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisKeyValue {
    pub async fn new(url: &str) -> Result<Self, RedisKeyValueError> {
        let client = Client::open(url).map_err(RedisKeyValueError::InvalidUrl)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(RedisKeyValueError::ConnectionFailed)?;

        Ok(Self {
            client,
            manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

impl KeyValueService for RedisKeyValue {
    type Subscription = RedisSubscription;

    #[instrument(name = "redis.set_if_absent", skip(self, value))]
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|error| map_redis_error(error, LockOperation::SetIfAbsent))?;

        Ok(reply.is_some())
    }

    #[instrument(name = "redis.delete", skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|error| map_redis_error(error, LockOperation::Delete))?;

        Ok(removed > 0)
    }

    #[instrument(name = "redis.delete_if_equals", skip(self, expected))]
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|error| map_redis_error(error, LockOperation::CompareAndDelete))?;

        Ok(removed > 0)
    }

    #[instrument(name = "redis.time_to_live", skip(self))]
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, LockError> {
        let mut conn = self.manager.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|error| map_redis_error(error, LockOperation::TimeToLive))?;

        Ok(remaining_lease(millis))
    }

    #[instrument(name = "redis.publish", skip(self, message))]
    async fn publish(&self, channel: &str, message: &str) -> Result<(), LockError> {
        let mut conn = self.manager.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|error| map_redis_error(error, LockOperation::Publish))?;

        trace!(channel, receivers, "[redis.published] release announced");
        Ok(())
    }

    #[instrument(name = "redis.subscribe", skip(self))]
    async fn subscribe(&self, channel: &str) -> Result<RedisSubscription, LockError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|error| map_redis_error(error, LockOperation::Subscribe))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|error| map_redis_error(error, LockOperation::Subscribe))?;

        Ok(RedisSubscription {
            messages: Box::pin(pubsub.into_on_message()),
        })
    }
}

/// Messages from one Redis channel on a dedicated pub/sub connection.
///
/// Dropping the subscription closes the connection.
pub struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

impl ReleaseSubscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<String>, LockError> {
        match self.messages.next().await {
            Some(message) => message
                .get_payload::<String>()
                .map(Some)
                .map_err(|error| map_redis_error(error, LockOperation::ReceiveNotification)),
            None => Ok(None),
        }
    }
}

/// `PX` takes whole milliseconds and rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Interpret a `PTTL` reply: -2 means the key is gone, -1 that it never expires.
fn remaining_lease(millis: i64) -> Option<Duration> {
    match millis {
        -2 => None,
        -1 => Some(Duration::MAX),
        millis => Some(Duration::from_millis(u64::try_from(millis).unwrap_or(0))),
    }
}

fn map_redis_error(error: redis::RedisError, operation: LockOperation) -> LockError {
    error!(
        error = %error,
        operation = %operation,
        "[redis.command_error] redis command failed"
    );
    LockError::BackendUnavailable {
        operation,
        detail: error.to_string(),
    }
}
