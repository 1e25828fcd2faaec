mod common;

mod postgres_contract_suite {
    use std::time::Duration;

    use stocklock::{
        AdvisoryLockBackend, Backoff, InProcessMutexFacade, LockedFacade, NamedLockFacade,
        OptimisticLockFacade, PessimisticLockFacade, RetryPolicy,
    };
    use stocklock_postgres::{PostgresAdvisoryLocks, PostgresResourceStore};
    use stocklock_testing::contract::{decrease_contract_tests, lock_backend_contract_tests};

    use crate::common::{make_advisory_locks, make_store};

    pub fn pessimistic_facade() -> PessimisticLockFacade<PostgresResourceStore> {
        PessimisticLockFacade::new(make_store())
    }

    pub fn optimistic_facade() -> OptimisticLockFacade<PostgresResourceStore> {
        let policy = RetryPolicy::new().backoff(Backoff::Fixed(Duration::from_millis(5)));
        OptimisticLockFacade::with_policy(make_store(), policy)
    }

    pub fn named_lock_facade() -> NamedLockFacade<PostgresAdvisoryLocks, PostgresResourceStore> {
        LockedFacade::new(AdvisoryLockBackend::new(make_advisory_locks()), make_store())
    }

    pub fn in_process_mutex_facade() -> InProcessMutexFacade<PostgresResourceStore> {
        InProcessMutexFacade::new(make_store())
    }

    pub fn advisory_backend() -> AdvisoryLockBackend<PostgresAdvisoryLocks> {
        AdvisoryLockBackend::new(make_advisory_locks())
    }

    decrease_contract_tests! {
        suite = pessimistic_on_postgres,
        make_facade = crate::postgres_contract_suite::pessimistic_facade,
    }

    decrease_contract_tests! {
        suite = optimistic_on_postgres,
        make_facade = crate::postgres_contract_suite::optimistic_facade,
    }

    decrease_contract_tests! {
        suite = named_lock_on_postgres,
        make_facade = crate::postgres_contract_suite::named_lock_facade,
    }

    decrease_contract_tests! {
        suite = in_process_mutex_on_postgres,
        make_facade = crate::postgres_contract_suite::in_process_mutex_facade,
    }

    lock_backend_contract_tests! {
        suite = advisory_backend_on_postgres,
        make_backend = crate::postgres_contract_suite::advisory_backend,
    }
}
