//! SQLSTATE classification.
//!
//! Postgres reports constraint failures with a SQLSTATE code and the name of
//! the violated constraint. [`classify`] turns that pair into a [`Violation`];
//! call sites then decide which typed [`StoreError`] a violation means for
//! the statement they ran.

use ordercore::{Operation, StoreError};
use tracing::{error, warn};

/// A classified database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Violation<'a> {
    /// 23503: a foreign key points at a missing row.
    ForeignKey(&'a str),
    /// 23505: a unique or primary key constraint.
    Unique(&'a str),
    /// 23514: a CHECK constraint.
    Check(&'a str),
    /// 55P03, 40P01, 40001: lock timeout, deadlock or serialization failure.
    Contention,
    /// Anything else.
    Other,
}

/// Classify a SQLSTATE code and constraint name.
pub(crate) fn classify<'a>(code: Option<&str>, constraint: Option<&'a str>) -> Violation<'a> {
    let constraint = constraint.unwrap_or_default();
    match code {
        Some("23503") => Violation::ForeignKey(constraint),
        Some("23505") => Violation::Unique(constraint),
        Some("23514") => Violation::Check(constraint),
        Some("55P03" | "40P01" | "40001") => Violation::Contention,
        _ => Violation::Other,
    }
}

/// Translate a sqlx error into a [`StoreError`].
///
/// `translate` gets the first say on constraint violations; contention is
/// always `LockContention`, and everything else is an opaque `StoreFailure`.
pub(crate) fn map_sqlx_error(
    error: sqlx::Error,
    operation: Operation,
    translate: impl FnOnce(&Violation<'_>) -> Option<StoreError>,
) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        let code = db_error.code();
        let violation = classify(code.as_deref(), db_error.constraint());

        if violation == Violation::Contention {
            warn!(
                error = %db_error,
                operation = %operation,
                "[postgres.lock_contention] lock wait failed"
            );
            return StoreError::LockContention { operation };
        }

        if let Some(store_error) = translate(&violation) {
            warn!(
                error = %db_error,
                operation = %operation,
                "[postgres.constraint_violation] statement rejected by constraint"
            );
            return store_error;
        }
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure { operation }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_violation_keeps_constraint_name() {
        assert_eq!(
            classify(Some("23503"), Some("orders_user_id_fkey")),
            Violation::ForeignKey("orders_user_id_fkey")
        );
    }

    #[test]
    fn unique_violation_keeps_constraint_name() {
        assert_eq!(
            classify(Some("23505"), Some("order_lines_pkey")),
            Violation::Unique("order_lines_pkey")
        );
    }

    #[test]
    fn check_violation_keeps_constraint_name() {
        assert_eq!(
            classify(Some("23514"), Some("products_quantity_check")),
            Violation::Check("products_quantity_check")
        );
    }

    #[test]
    fn lock_timeout_deadlock_and_serialization_are_contention() {
        for code in ["55P03", "40P01", "40001"] {
            assert_eq!(classify(Some(code), None), Violation::Contention);
        }
    }

    #[test]
    fn unknown_codes_are_other() {
        assert_eq!(classify(Some("42P01"), None), Violation::Other);
        assert_eq!(classify(None, Some("orders_pkey")), Violation::Other);
    }

    #[test]
    fn missing_constraint_name_classifies_with_empty_name() {
        assert_eq!(classify(Some("23505"), None), Violation::Unique(""));
    }

    #[test]
    fn non_database_errors_are_opaque_store_failures() {
        let store_error = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::BeginTransaction, |_| {
            panic!("translate must not run for non-database errors")
        });

        assert_eq!(
            store_error,
            StoreError::StoreFailure {
                operation: Operation::BeginTransaction
            }
        );
    }

    #[test]
    fn row_not_found_is_a_store_failure() {
        let store_error = map_sqlx_error(sqlx::Error::RowNotFound, Operation::ReadOrder, |_| None);

        assert_eq!(
            store_error,
            StoreError::StoreFailure {
                operation: Operation::ReadOrder
            }
        );
    }
}
