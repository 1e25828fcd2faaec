use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use stocklock::{LockBackend, LockError, LockHandle, LockKey};

/// One acquire-to-release span observed by a [`RecordingLockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInterval {
    pub key: LockKey,
    pub acquired_at: Instant,
    pub released_at: Instant,
}

impl LockInterval {
    /// True when the two spans share any instant.
    pub fn overlaps(&self, other: &LockInterval) -> bool {
        self.key == other.key
            && self.acquired_at < other.released_at
            && other.acquired_at < self.released_at
    }
}

/// Handle returned by [`RecordingLockBackend`], wrapping the inner handle.
pub struct RecordedHandle<H> {
    inner: H,
    acquired_at: Instant,
}

impl<H: AsRef<LockHandle>> AsRef<LockHandle> for RecordedHandle<H> {
    fn as_ref(&self) -> &LockHandle {
        self.inner.as_ref()
    }
}

/// Lock backend wrapper that records when each acquisition was held.
///
/// The acquisition instant is taken after the inner backend grants the lock
/// and the release instant before the inner backend gives it back, so for a
/// correct backend the recorded spans of one key never overlap.
#[derive(Clone)]
pub struct RecordingLockBackend<B> {
    inner: B,
    intervals: Arc<Mutex<Vec<LockInterval>>>,
}

impl<B> RecordingLockBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            intervals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// All completed intervals, in release order.
    pub fn intervals(&self) -> Vec<LockInterval> {
        self.intervals
            .lock()
            .expect("interval log mutex should not be poisoned")
            .clone()
    }

    /// First pair of intervals on the same key that overlap, if any.
    pub fn find_overlap(&self) -> Option<(LockInterval, LockInterval)> {
        let mut by_key: HashMap<LockKey, Vec<LockInterval>> = HashMap::new();
        for interval in self.intervals() {
            by_key.entry(interval.key.clone()).or_default().push(interval);
        }

        by_key.into_values().find_map(|mut intervals| {
            intervals.sort_by_key(|interval| interval.acquired_at);
            intervals
                .windows(2)
                .find(|pair| pair[0].overlaps(&pair[1]))
                .map(|pair| (pair[0].clone(), pair[1].clone()))
        })
    }
}

impl<B: LockBackend> LockBackend for RecordingLockBackend<B> {
    type Handle = RecordedHandle<B::Handle>;

    async fn acquire(&self, key: &LockKey) -> Result<Self::Handle, LockError> {
        let inner = self.inner.acquire(key).await?;
        Ok(RecordedHandle {
            inner,
            acquired_at: Instant::now(),
        })
    }

    async fn try_acquire(&self, key: &LockKey) -> Result<Option<Self::Handle>, LockError> {
        let inner = self.inner.try_acquire(key).await?;
        Ok(inner.map(|inner| RecordedHandle {
            inner,
            acquired_at: Instant::now(),
        }))
    }

    async fn release(&self, handle: Self::Handle) -> Result<(), LockError> {
        let interval = LockInterval {
            key: handle.as_ref().key().clone(),
            acquired_at: handle.acquired_at,
            released_at: Instant::now(),
        };
        self.intervals
            .lock()
            .expect("interval log mutex should not be poisoned")
            .push(interval);

        self.inner.release(handle.inner).await
    }
}
