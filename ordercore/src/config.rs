//! Coordinator configuration.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Deadline for one order placement, in milliseconds.
///
/// Bounded between 100 ms and 10 minutes; a transaction that may hold row
/// locks for longer than that is a bug, not a configuration.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Display,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct OrderTimeoutMs(u64);

impl OrderTimeoutMs {
    /// The timeout as a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Order in which a unit of work takes product row locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOrdering {
    /// Ascending product id. Two orders over the same products always lock
    /// in the same sequence and cannot deadlock.
    #[default]
    ProductId,
    /// The order lines appear in the request.
    RequestOrder,
}

/// What to do when the caller's declared total differs from the computed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalPolicy {
    /// Reject the order with `OrderError::TotalMismatch`.
    #[default]
    Enforce,
    /// Store the computed total and log a warning.
    Recompute,
}

/// Settings for [`crate::OrderCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Deadline applied by [`crate::OrderCoordinator::create_order`].
    pub order_timeout: OrderTimeoutMs,
    /// Order in which product rows are locked.
    pub lock_ordering: LockOrdering,
    /// What happens when a declared total disagrees with the computed one.
    pub total_policy: TotalPolicy,
}

impl CoordinatorConfig {
    /// Replace the order deadline.
    #[must_use]
    pub const fn with_order_timeout(mut self, order_timeout: OrderTimeoutMs) -> Self {
        self.order_timeout = order_timeout;
        self
    }

    /// Replace the lock ordering.
    #[must_use]
    pub const fn with_lock_ordering(mut self, lock_ordering: LockOrdering) -> Self {
        self.lock_ordering = lock_ordering;
        self
    }

    /// Replace the total policy.
    #[must_use]
    pub const fn with_total_policy(mut self, total_policy: TotalPolicy) -> Self {
        self.total_policy = total_policy;
        self
    }
}
