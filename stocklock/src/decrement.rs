use stocklock_types::{
    DecreaseError, ExpectedVersion, Quantity, ReadMode, ResourceId, ResourceStore,
    StoreTransaction,
};
use tracing::{debug, info, instrument, warn};

/// The critical section: load, validate sufficiency, subtract, persist.
///
/// Always runs in a fresh unit of work obtained from `store`, independent of
/// any lock session the caller holds. `mode` is chosen by the enclosing
/// strategy: [`ReadMode::Exclusive`] takes the row lock,
/// [`ReadMode::Versioned`] conditions the write on the read version, and
/// [`ReadMode::Plain`] relies on an external lock.
///
/// On any failure the unit of work is rolled back and nothing is persisted.
///
/// # Errors
///
/// - [`DecreaseError::NotFound`] when no resource exists for `id`
/// - [`DecreaseError::InsufficientQuantity`] when `amount` exceeds the quantity
/// - [`DecreaseError::OptimisticConflict`] when a versioned write lost a race
/// - [`DecreaseError::StoreUnavailable`] on store infrastructure failures
#[instrument(name = "decrement.decrease", skip(store))]
pub async fn decrement<S: ResourceStore>(
    store: &S,
    id: ResourceId,
    amount: Quantity,
    mode: ReadMode,
) -> Result<(), DecreaseError> {
    let mut transaction = store.begin().await?;

    match apply(&mut transaction, id, amount, mode).await {
        Ok(remaining) => {
            transaction.commit().await?;
            info!(
                resource_id = %id,
                amount = %amount,
                remaining = %remaining,
                "[decrement.committed] quantity decreased"
            );
            Ok(())
        }
        Err(error) => {
            if let Err(rollback_error) = transaction.rollback().await {
                warn!(
                    resource_id = %id,
                    error = %rollback_error,
                    "[decrement.rollback_failed] rollback after failed decrement did not complete"
                );
            }
            debug!(resource_id = %id, error = %error, "[decrement.aborted] nothing persisted");
            Err(error)
        }
    }
}

async fn apply<T: StoreTransaction>(
    transaction: &mut T,
    id: ResourceId,
    amount: Quantity,
    mode: ReadMode,
) -> Result<Quantity, DecreaseError> {
    let current = transaction
        .read(id, mode)
        .await?
        .ok_or(DecreaseError::NotFound { resource_id: id })?;

    let updated = current.decrease(amount)?;

    transaction
        .write(&updated, ExpectedVersion::for_read(mode, &current))
        .await?;

    Ok(updated.quantity())
}
