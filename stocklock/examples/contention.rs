//! Races 100 single-unit decrements against a stock of 100 under every
//! strategy, using the in-memory collaborators.
//!
//! ```text
//! RUST_LOG=stocklock=debug cargo run -p stocklock --example contention
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use stocklock::{
    AdvisoryLockBackend, BlockingLockBackend, BlockingLockConfig, DecreaseStock,
    InProcessMutexFacade, LockedFacade, OptimisticLockFacade, PessimisticLockFacade, ProductId,
    Quantity, Resource, ResourceId, ResourceStore, RetryPolicy, SpinLockBackend, SpinLockConfig,
    UnguardedFacade,
};
use stocklock_memory::{InMemoryAdvisoryLocks, InMemoryKeyValue, InMemoryResourceStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const INITIAL: u64 = 100;
const CALLERS: usize = 100;

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stocklock=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn seeded_store(id: ResourceId) -> Result<InMemoryResourceStore, Box<dyn std::error::Error>> {
    let store = InMemoryResourceStore::new();
    store
        .insert(Resource::new(id, ProductId::try_new(1)?, Quantity::new(INITIAL)))
        .await?;
    Ok(store)
}

async fn race<F>(name: &str, id: ResourceId, facade: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: DecreaseStock + 'static,
{
    let facade = Arc::new(facade);
    let started = Instant::now();

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let facade = Arc::clone(&facade);
            tokio::spawn(async move { facade.decrease(id, Quantity::new(1)).await })
        })
        .collect();

    let mut failed = 0_usize;
    for task in tasks {
        if let Err(error) = task.await? {
            warn!(strategy = name, error = %error, "decrease failed");
            failed += 1;
        }
    }

    let remaining = facade
        .store()
        .fetch(id)
        .await?
        .map_or(Quantity::new(0), |resource| resource.quantity());

    info!(
        strategy = name,
        remaining = %remaining,
        failed,
        elapsed = ?started.elapsed(),
        "race finished"
    );
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let id = ResourceId::try_new(1)?;

    race("unguarded", id, UnguardedFacade::new(seeded_store(id).await?)).await?;
    race(
        "in_process_mutex",
        id,
        InProcessMutexFacade::new(seeded_store(id).await?),
    )
    .await?;
    race(
        "row_lock",
        id,
        PessimisticLockFacade::new(seeded_store(id).await?),
    )
    .await?;
    race(
        "optimistic",
        id,
        OptimisticLockFacade::with_policy(
            seeded_store(id).await?,
            RetryPolicy::new().max_retries(1_000),
        ),
    )
    .await?;
    race(
        "named_lock",
        id,
        LockedFacade::new(
            AdvisoryLockBackend::new(InMemoryAdvisoryLocks::new()),
            seeded_store(id).await?,
        ),
    )
    .await?;
    race(
        "spin_lock",
        id,
        LockedFacade::new(
            SpinLockBackend::with_config(
                InMemoryKeyValue::new(),
                SpinLockConfig::default().with_retry_interval(Duration::from_millis(5)),
            ),
            seeded_store(id).await?,
        ),
    )
    .await?;
    race(
        "blocking_lock",
        id,
        LockedFacade::new(
            BlockingLockBackend::with_config(
                InMemoryKeyValue::new(),
                BlockingLockConfig::default().with_wait_timeout(Duration::from_secs(60)),
            ),
            seeded_store(id).await?,
        ),
    )
    .await?;

    Ok(())
}
