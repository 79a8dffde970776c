//! Shared validation predicates for domain types.
//!
//! This module contains validation functions used by nutype-based domain types
//! across the ordercore crate.

use rust_decimal::Decimal;

/// Validation predicate: monetary amounts are never negative.
///
/// `Decimal` keeps a sign bit on zero, so `-0.00` is accepted and treated as zero.
pub(crate) fn is_non_negative(amount: &Decimal) -> bool {
    amount.is_zero() || amount.is_sign_positive()
}

/// Validation predicate: reject ASCII and Unicode control characters.
///
/// Idempotency keys travel in headers and log lines, so they must be printable.
pub(crate) fn no_control_characters(s: &str) -> bool {
    !s.chars().any(char::is_control)
}
