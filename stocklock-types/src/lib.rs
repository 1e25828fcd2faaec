#![forbid(unsafe_code)]
#![deny(
    bad_style,
    non_ascii_idents,
    rust_2018_idioms,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut
)]

//! Shared vocabulary types and traits for the StockLock inventory locking library.
//!
//! This crate provides the foundational types that are shared between the main
//! `stocklock` crate and the adapter implementations (`stocklock-memory`,
//! `stocklock-postgres`, `stocklock-redis`). Keeping them here lets adapters
//! implement the collaborator contracts without depending on the strategies
//! built on top of them.
//!
//! # Overview
//!
//! This crate contains:
//! - Domain types: `ResourceId`, `ProductId`, `Quantity`, `Version`, `Resource`
//! - Store contract: `ResourceStore`, `StoreTransaction`, `ReadMode`, `ExpectedVersion`
//! - Lock contracts: `LockBackend`, `KeyValueService`, `ReleaseSubscription`,
//!   `AdvisoryLockService`, `AdvisorySession`, with `LockKey` and `LockHandle`
//! - Errors: `StoreError`, `LockError`, `DecreaseError`, `Operation`, `LockOperation`

mod advisory;
mod errors;
mod kv;
mod lock;
mod resource;
mod store;
mod validation;

pub use advisory::{AdvisoryLockService, AdvisorySession};
pub use errors::DecreaseError;
pub use kv::{KeyValueService, ReleaseSubscription};
pub use lock::{
    LockBackend, LockError, LockHandle, LockKey, LockKeyError, LockKeyPrefix, LockKeyPrefixError,
    LockOperation, OwnerToken,
};
pub use resource::{
    ProductId, ProductIdError, Quantity, Resource, ResourceId, ResourceIdError, Version,
};
pub use store::{
    ExpectedVersion, Operation, ReadMode, ResourceStore, StoreError, StoreTransaction,
};
