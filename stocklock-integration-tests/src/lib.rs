//! Integration tests for `StockLock`
//!
//! This crate runs the contract suites from `stocklock-testing` against the
//! PostgreSQL and Redis adapters, using containers started on demand.

// This is a test-only crate
#![cfg(test)]
