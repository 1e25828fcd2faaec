//! Shared validation predicates for domain types.
//!
//! This module contains validation functions used by nutype-based domain types
//! across the stocklock crates.

/// Validation predicate: reject whitespace and control characters.
///
/// Lock keys travel verbatim into Redis commands, pub/sub channel names and
/// PostgreSQL advisory-lock hashes. Whitespace or control characters make
/// those keys ambiguous in logs and in `redis-cli` sessions.
pub(crate) fn no_whitespace_or_control(s: &str) -> bool {
    !s.chars().any(|c| c.is_whitespace() || c.is_control())
}
