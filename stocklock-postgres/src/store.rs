use sqlx::{Pool, Postgres, Row, Transaction, postgres::PgRow, query};
use stocklock_types::{
    ExpectedVersion, Operation, ProductId, Quantity, ReadMode, Resource, ResourceId,
    ResourceStore, StoreError, StoreTransaction, Version,
};
use tracing::{info, instrument, warn};

use crate::{PostgresConfig, PostgresStoreError, connect, map_sqlx_error};

const SELECT_PLAIN: &str = "SELECT product_id, quantity, version FROM stock WHERE id = $1";
const SELECT_FOR_UPDATE: &str =
    "SELECT product_id, quantity, version FROM stock WHERE id = $1 FOR UPDATE";
const UPDATE_ANY: &str = "UPDATE stock SET quantity = $2, version = version + 1 WHERE id = $1";
const UPDATE_AT_VERSION: &str =
    "UPDATE stock SET quantity = $2, version = version + 1 WHERE id = $1 AND version = $3";
const UPSERT: &str = "INSERT INTO stock (id, product_id, quantity, version)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT (id) DO UPDATE
     SET product_id = EXCLUDED.product_id,
         quantity = EXCLUDED.quantity,
         version = EXCLUDED.version";

#[derive(Debug, Clone)]
pub struct PostgresResourceStore {
    pool: Pool<Postgres>,
}

impl PostgresResourceStore {
    /// Create a new PostgresResourceStore with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new PostgresResourceStore with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let pool = connect(connection_string.into(), config).await?;
        Ok(Self { pool })
    }

    /// Create a PostgresResourceStore from an existing connection pool.
    ///
    /// Do not share this pool with [`crate::PostgresAdvisoryLocks`].
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> Result<(), PostgresStoreError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(PostgresStoreError::PingFailed)
    }

    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStoreError::MigrationFailed)
    }
}

impl ResourceStore for PostgresResourceStore {
    type Transaction = PostgresTransaction;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self) -> Result<PostgresTransaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        Ok(PostgresTransaction { tx })
    }

    #[instrument(name = "postgres.fetch", skip(self))]
    async fn fetch(&self, id: ResourceId) -> Result<Option<Resource>, StoreError> {
        let row = query(SELECT_PLAIN)
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::FetchResource))?;

        row.map(|row| resource_from_row(id, &row, Operation::FetchResource))
            .transpose()
    }

    #[instrument(name = "postgres.insert", skip(self))]
    async fn insert(&self, resource: Resource) -> Result<(), StoreError> {
        query(UPSERT)
            .bind(resource.id().into_inner())
            .bind(resource.product_id().into_inner())
            .bind(to_bigint(resource.id(), resource.quantity().into_inner())?)
            .bind(to_bigint(resource.id(), resource.version().into_inner())?)
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::InsertResource))?;

        info!(resource_id = %resource.id(), "[postgres.inserted] resource seeded");
        Ok(())
    }
}

/// Unit of work on one pooled connection.
///
/// Row locks taken by exclusive reads are held until commit or rollback.
/// Dropping the transaction rolls it back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl StoreTransaction for PostgresTransaction {
    #[instrument(name = "postgres.read", skip(self))]
    async fn read(
        &mut self,
        id: ResourceId,
        mode: ReadMode,
    ) -> Result<Option<Resource>, StoreError> {
        let sql = match mode {
            ReadMode::Exclusive => SELECT_FOR_UPDATE,
            ReadMode::Plain | ReadMode::Versioned => SELECT_PLAIN,
        };

        let row = query(sql)
            .bind(id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ReadResource))?;

        row.map(|row| resource_from_row(id, &row, Operation::ReadResource))
            .transpose()
    }

    #[instrument(name = "postgres.write", skip(self, resource), fields(resource_id = %resource.id()))]
    async fn write(
        &mut self,
        resource: &Resource,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = resource.id();
        let quantity = to_bigint(id, resource.quantity().into_inner())?;

        let update = match expected {
            ExpectedVersion::Any => query(UPDATE_ANY).bind(id.into_inner()).bind(quantity),
            ExpectedVersion::Exact(version) => query(UPDATE_AT_VERSION)
                .bind(id.into_inner())
                .bind(quantity)
                .bind(to_bigint(id, version.into_inner())?),
        };

        let result = update
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::WriteResource))?;

        if result.rows_affected() == 0 {
            return Err(match expected {
                ExpectedVersion::Exact(version) => {
                    warn!(
                        resource_id = %id,
                        expected = %version,
                        "[postgres.version_conflict] optimistic concurrency check failed"
                    );
                    StoreError::VersionConflict { resource_id: id }
                }
                ExpectedVersion::Any => StoreError::NotFound { resource_id: id },
            });
        }

        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::RollbackTransaction))
    }
}

fn resource_from_row(
    id: ResourceId,
    row: &PgRow,
    operation: Operation,
) -> Result<Resource, StoreError> {
    let column = |name: &str| -> Result<i64, StoreError> {
        row.try_get(name)
            .map_err(|error| map_sqlx_error(error, operation))
    };

    resource_from_columns(id, column("product_id")?, column("quantity")?, column("version")?)
}

/// Rebuild a resource from raw `BIGINT` columns, rejecting values the domain
/// cannot represent.
fn resource_from_columns(
    id: ResourceId,
    product_id: i64,
    quantity: i64,
    version: i64,
) -> Result<Resource, StoreError> {
    let corrupt = |detail: String| {
        warn!(resource_id = %id, detail = %detail, "[postgres.corrupt_record] row failed validation");
        StoreError::CorruptRecord {
            resource_id: id,
            detail,
        }
    };

    let product_id = ProductId::try_new(product_id)
        .map_err(|error| corrupt(format!("invalid product id {product_id}: {error}")))?;
    let quantity = u64::try_from(quantity)
        .map_err(|_| corrupt(format!("negative quantity {quantity}")))?;
    let version =
        u64::try_from(version).map_err(|_| corrupt(format!("negative version {version}")))?;

    Ok(Resource::restore(
        id,
        product_id,
        Quantity::new(quantity),
        Version::new(version),
    ))
}

fn to_bigint(id: ResourceId, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::CorruptRecord {
        resource_id: id,
        detail: format!("{value} does not fit a BIGINT column"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id() -> ResourceId {
        ResourceId::try_new(42).expect("valid resource id")
    }

    #[test]
    fn valid_columns_rebuild_the_resource() {
        let resource = resource_from_columns(id(), 7, 10, 3).expect("valid row");

        assert_eq!(resource.quantity(), Quantity::new(10));
        assert_eq!(resource.version(), Version::new(3));
        assert_eq!(resource.product_id(), ProductId::try_new(7).expect("valid"));
    }

    #[test]
    fn quantities_beyond_bigint_are_refused_before_writing() {
        assert!(matches!(
            to_bigint(id(), u64::MAX),
            Err(StoreError::CorruptRecord { .. })
        ));
    }

    proptest! {
        #[test]
        fn negative_quantities_are_corrupt(quantity in i64::MIN..0) {
            let result = resource_from_columns(id(), 1, quantity, 0);

            prop_assert!(
                matches!(result, Err(StoreError::CorruptRecord { resource_id, .. }) if resource_id == id()),
                "expected corrupt record for quantity {quantity}"
            );
        }

        #[test]
        fn non_negative_quantities_round_trip(quantity in 0_i64..=i64::MAX) {
            let resource = resource_from_columns(id(), 1, quantity, 0).expect("valid row");

            prop_assert_eq!(to_bigint(id(), resource.quantity().into_inner()), Ok(quantity));
        }
    }
}
