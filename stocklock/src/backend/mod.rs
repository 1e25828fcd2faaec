//! Explicit lock backends.
//!
//! Each backend implements [`stocklock_types::LockBackend`] on top of one
//! external collaborator trait, so the same acquisition logic runs against
//! PostgreSQL, Redis or the in-memory services.

mod advisory;
mod blocking;
mod spin;
mod waiters;

pub use advisory::{AdvisoryLockBackend, AdvisoryLockConfig, AdvisoryLockHandle};
pub use blocking::{BlockingLockBackend, BlockingLockConfig, release_channel};
pub use spin::{ReleaseMode, SpinLockBackend, SpinLockConfig};
