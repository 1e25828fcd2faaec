//! In-memory adapters for `StockLock`
//!
//! This crate provides in-process implementations of every collaborator the
//! `stocklock` strategies depend on, useful for testing and single-process
//! development where PostgreSQL and Redis are not available:
//!
//! - [`InMemoryResourceStore`]: resource rows with emulated row locks and
//!   version checks
//! - [`InMemoryKeyValue`]: expiring entries plus broadcast-based pub/sub
//! - [`InMemoryAdvisoryLocks`]: named locks scoped to sessions

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod advisory;
mod kv;
mod store;

pub use advisory::{InMemoryAdvisoryLocks, InMemoryAdvisorySession};
pub use kv::{InMemoryKeyValue, InMemorySubscription};
pub use store::{InMemoryResourceStore, InMemoryTransaction};
