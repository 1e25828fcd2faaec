#![forbid(
    dead_code,
    invalid_value,
    overflowing_literals,
    unconditional_recursion,
    unsafe_code
)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    trivial_casts,
    unreachable_code,
    unused_assignments,
    unused_attributes,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_variables
)]

//! Reusable verification for `StockLock` strategies and adapters.
//!
//! - [`contract`]: scenario functions plus the `decrease_contract_tests!`,
//!   `lock_backend_contract_tests!` and `leased_lock_contract_tests!` macros
//! - [`chaos`]: a resource store wrapper that injects failures and conflicts
//! - [`recording`]: a lock backend wrapper that records hold intervals

pub mod chaos;
pub mod contract;
pub mod recording;

pub use chaos::*;
pub use recording::*;
