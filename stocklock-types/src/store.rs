use crate::resource::{Resource, ResourceId, Version};
use std::future::Future;

/// How the decrement path reads the resource row.
///
/// Each locking strategy requires a specific read mode: plain reads for
/// strategies that hold an external lock, exclusive reads for the row-lock
/// strategy, and version-stamped reads for the optimistic strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Committed read with no lock taken.
    Plain,
    /// Row-level exclusive read (`SELECT ... FOR UPDATE`). Blocks competing
    /// exclusive reads and writes on the same row until the transaction ends.
    Exclusive,
    /// Read whose version the subsequent write will be conditioned on.
    Versioned,
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Write unconditionally.
    Any,
    /// Write only if the persisted version still equals this one.
    Exact(Version),
}

impl ExpectedVersion {
    /// The expectation that matches a read performed in `mode`.
    pub fn for_read(mode: ReadMode, read: &Resource) -> Self {
        match mode {
            ReadMode::Versioned => ExpectedVersion::Exact(read.version()),
            ReadMode::Plain | ReadMode::Exclusive => ExpectedVersion::Any,
        }
    }
}

/// Identifies the resource store operation that failed.
///
/// Used by `StoreError::StoreFailure` to provide strongly-typed
/// identification of which operation encountered an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Beginning a unit of work.
    BeginTransaction,
    /// Reading a resource inside a unit of work.
    ReadResource,
    /// Writing a resource inside a unit of work.
    WriteResource,
    /// Committing a unit of work.
    CommitTransaction,
    /// Rolling back a unit of work.
    RollbackTransaction,
    /// Reading a resource outside any unit of work.
    FetchResource,
    /// Seeding a resource.
    InsertResource,
    /// Applying schema migrations.
    Migrate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::BeginTransaction => write!(f, "begin_transaction"),
            Operation::ReadResource => write!(f, "read_resource"),
            Operation::WriteResource => write!(f, "write_resource"),
            Operation::CommitTransaction => write!(f, "commit_transaction"),
            Operation::RollbackTransaction => write!(f, "rollback_transaction"),
            Operation::FetchResource => write!(f, "fetch_resource"),
            Operation::InsertResource => write!(f, "insert_resource"),
            Operation::Migrate => write!(f, "migrate"),
        }
    }
}

/// Error type returned by resource store operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Version conflict during optimistic concurrency control.
    ///
    /// Returned when a write conditioned on [`ExpectedVersion::Exact`] finds
    /// that another writer committed first.
    #[error("version conflict detected for resource {resource_id}")]
    VersionConflict { resource_id: ResourceId },

    /// The row disappeared between read and write.
    #[error("resource {resource_id} no longer exists")]
    NotFound { resource_id: ResourceId },

    /// A persisted row could not be mapped back to a [`Resource`].
    #[error("resource {resource_id} has a corrupt record: {detail}")]
    CorruptRecord {
        resource_id: ResourceId,
        detail: String,
    },

    /// Represents infrastructure failures surfaced by the backing store (e.g., connection drops).
    #[error("{operation} operation failed")]
    StoreFailure { operation: Operation },
}

/// Persistence accessor for counted resources.
///
/// The decrement path only ever works through a [`StoreTransaction`] obtained
/// from [`ResourceStore::begin`]; `fetch` and `insert` exist for observers and
/// fixtures that live outside the core.
///
/// Implementations include:
/// - `stocklock-postgres`: PostgreSQL backend with real row locks
/// - `stocklock-memory`: in-memory backend emulating row locks for tests
pub trait ResourceStore: Send + Sync {
    /// The unit of work type handed out by [`ResourceStore::begin`].
    type Transaction: StoreTransaction;

    /// Begin an independent unit of work.
    ///
    /// Every call opens a fresh unit of work; nothing is shared with any lock
    /// session the caller might be holding.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;

    /// Plain committed read outside any unit of work.
    fn fetch(
        &self,
        id: ResourceId,
    ) -> impl Future<Output = Result<Option<Resource>, StoreError>> + Send;

    /// Seed a resource. Never called by the decrement path.
    fn insert(&self, resource: Resource) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A unit of work against a [`ResourceStore`].
///
/// Locks taken by [`ReadMode::Exclusive`] reads are held until `commit` or
/// `rollback`. Dropping a transaction without committing rolls it back.
pub trait StoreTransaction: Send {
    /// Read the resource using the given mode. `Ok(None)` when it does not exist.
    fn read(
        &mut self,
        id: ResourceId,
        mode: ReadMode,
    ) -> impl Future<Output = Result<Option<Resource>, StoreError>> + Send;

    /// Persist the resource's quantity and advance its version.
    ///
    /// With [`ExpectedVersion::Exact`] the write fails with
    /// [`StoreError::VersionConflict`] if the persisted version moved on.
    fn write(
        &mut self,
        resource: &Resource,
        expected: ExpectedVersion,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Commit the unit of work, releasing any row locks it holds.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Roll back the unit of work, releasing any row locks it holds.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ProductId, Quantity};

    fn resource_at(version: u64) -> Resource {
        Resource::restore(
            ResourceId::try_new(9).expect("valid resource id"),
            ProductId::try_new(3).expect("valid product id"),
            Quantity::new(4),
            Version::new(version),
        )
    }

    #[test]
    fn versioned_reads_expect_exact_version() {
        let read = resource_at(7);

        let expected = ExpectedVersion::for_read(ReadMode::Versioned, &read);

        assert_eq!(expected, ExpectedVersion::Exact(Version::new(7)));
    }

    #[test]
    fn plain_and_exclusive_reads_write_unconditionally() {
        let read = resource_at(7);

        assert_eq!(
            ExpectedVersion::for_read(ReadMode::Plain, &read),
            ExpectedVersion::Any
        );
        assert_eq!(
            ExpectedVersion::for_read(ReadMode::Exclusive, &read),
            ExpectedVersion::Any
        );
    }

    #[test]
    fn store_failure_message_names_the_operation() {
        let error = StoreError::StoreFailure {
            operation: Operation::CommitTransaction,
        };

        assert_eq!(error.to_string(), "commit_transaction operation failed");
    }
}
