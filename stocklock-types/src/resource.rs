use crate::errors::DecreaseError;
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Resource identifier domain type.
///
/// ResourceId identifies one counted row (a stock entry). It is stored as a
/// `BIGINT` primary key, so it is a positive 64-bit integer; zero and negative
/// values are rejected at construction.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceId(i64);

/// Identifier of the product a resource counts.
///
/// The core never reads or writes it; it is carried so a persisted row can be
/// rebuilt faithfully.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(i64);

/// Available quantity of a resource.
///
/// Quantities are unsigned, so a negative count is unrepresentable once a
/// value has been constructed.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    From,
    Into,
    Serialize,
    Deserialize
))]
pub struct Quantity(u64);

impl Quantity {
    /// Subtract `amount`, returning `None` when the result would be negative.
    pub fn checked_sub(self, amount: Quantity) -> Option<Quantity> {
        self.into_inner()
            .checked_sub(amount.into_inner())
            .map(Quantity::new)
    }

    /// Returns true when nothing is left.
    pub fn is_zero(self) -> bool {
        self.into_inner() == 0
    }
}

/// Resource version domain type.
///
/// Version counts committed writes to a resource. Every successful write
/// increments it by one; the optimistic strategy compares it to detect
/// concurrent modification.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Version(u64);

impl Version {
    /// Version of a freshly seeded resource.
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Increment the version by 1.
    pub fn increment(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// One counted item.
///
/// Resources are created and seeded outside the core. The only field the
/// decrement path changes is `quantity`; `version` is advanced by the store on
/// every committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    id: ResourceId,
    product_id: ProductId,
    quantity: Quantity,
    version: Version,
}

impl Resource {
    /// Create a resource at [`Version::initial`].
    pub fn new(id: ResourceId, product_id: ProductId, quantity: Quantity) -> Self {
        Self {
            id,
            product_id,
            quantity,
            version: Version::initial(),
        }
    }

    /// Rebuild a resource read back from a store.
    pub fn restore(
        id: ResourceId,
        product_id: ProductId,
        quantity: Quantity,
        version: Version,
    ) -> Self {
        Self {
            id,
            product_id,
            quantity,
            version,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Validate sufficiency and subtract `amount`.
    ///
    /// Returns the updated resource with the same version it was read at; the
    /// store is responsible for advancing the version when the write commits.
    /// `self` is left untouched on failure.
    pub fn decrease(&self, amount: Quantity) -> Result<Resource, DecreaseError> {
        let remaining =
            self.quantity
                .checked_sub(amount)
                .ok_or(DecreaseError::InsufficientQuantity {
                    resource_id: self.id,
                    requested: amount,
                    available: self.quantity,
                })?;

        Ok(Resource {
            quantity: remaining,
            ..self.clone()
        })
    }
}
