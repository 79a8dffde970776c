//! Error taxonomy for order placement.
//!
//! Adapters report [`StoreError`]; the coordinator translates those into the
//! caller-facing [`OrderError`]. Neither layer inspects error strings.

use std::time::Duration;

use thiserror::Error;

use crate::request::RequestError;
use crate::types::{IdempotencyKey, OrderId, Price, ProductId, Quantity, StockLevel, UserId};

/// Store operation during which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Opening a unit of work.
    BeginTransaction,
    /// Taking the row lock on a product and reading it.
    LockProduct,
    /// Reducing the stock of a product.
    DecrementQuantity,
    /// Writing the order header.
    InsertOrderHeader,
    /// Writing one order line.
    InsertOrderLine,
    /// Rewriting the stored order total.
    UpdateOrderTotal,
    /// Committing a unit of work.
    CommitTransaction,
    /// Rolling back a unit of work.
    RollbackTransaction,
    /// Reading an order aggregate.
    ReadOrder,
    /// Reading a product outside an order.
    ReadProduct,
    /// Creating or updating a product outside an order.
    WriteProduct,
    /// Reading a user.
    ReadUser,
    /// Creating a user.
    WriteUser,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::LockProduct => write!(f, "lock_product"),
            Self::DecrementQuantity => write!(f, "decrement_quantity"),
            Self::InsertOrderHeader => write!(f, "insert_order_header"),
            Self::InsertOrderLine => write!(f, "insert_order_line"),
            Self::UpdateOrderTotal => write!(f, "update_order_total"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
            Self::RollbackTransaction => write!(f, "rollback_transaction"),
            Self::ReadOrder => write!(f, "read_order"),
            Self::ReadProduct => write!(f, "read_product"),
            Self::WriteProduct => write!(f, "write_product"),
            Self::ReadUser => write!(f, "read_user"),
            Self::WriteUser => write!(f, "write_user"),
        }
    }
}

/// Kind of entity a missing reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Buyer,
    Product,
    Order,
    User,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buyer => write!(f, "buyer"),
            Self::Product => write!(f, "product"),
            Self::Order => write!(f, "order"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Typed failures reported by store adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("buyer {0} does not exist")]
    BuyerNotFound(UserId),

    #[error("product {0} does not exist")]
    ProductNotFound(ProductId),

    #[error("order {0} does not exist")]
    OrderNotFound(OrderId),

    #[error("order {order_id} already has a line for product {product_id}")]
    DuplicateLine {
        order_id: OrderId,
        product_id: ProductId,
    },

    #[error("an order with idempotency key {0} already exists")]
    DuplicateIdempotencyKey(IdempotencyKey),

    #[error("a user named {first_name} {last_name} already exists")]
    DuplicateUser {
        first_name: String,
        last_name: String,
    },

    /// The decrement would take stock below zero.
    #[error("decrementing product {product_id} by {requested} would make stock negative")]
    StockUnderflow {
        product_id: ProductId,
        requested: Quantity,
    },

    /// A row lock could not be acquired in time, or the store broke a deadlock.
    #[error("lock contention during {operation}")]
    LockContention { operation: Operation },

    /// Any other storage failure. Details are logged by the adapter.
    #[error("store operation {operation} failed")]
    StoreFailure { operation: Operation },
}

/// Coarse classification callers map onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The request itself is malformed.
    Invalid,
    /// A referenced entity does not exist.
    NotFound,
    /// The request conflicts with current state (stock, duplicates, totals).
    Conflict,
    /// The request could not finish in time; retrying may succeed.
    Unavailable,
    /// Storage failed in a way the caller cannot act on.
    Internal,
}

/// Why an order could not be placed or read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("invalid order request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("{kind} {id} not found")]
    ReferenceNotFound { kind: ReferenceKind, id: i64 },

    #[error(
        "insufficient inventory for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientInventory {
        product_id: ProductId,
        available: StockLevel,
        requested: Quantity,
    },

    #[error("product {0} appears on more than one line")]
    DuplicateLine(ProductId),

    #[error("declared total {declared} does not match computed total {computed}")]
    TotalMismatch { declared: Price, computed: Price },

    #[error("order placement exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// Storage failed. The message stays opaque; the operation tag is for logs.
    #[error("order could not be persisted")]
    PersistenceFailure { operation: Operation },
}

impl OrderError {
    /// Classify for transport mapping.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest(_) => ErrorClass::Invalid,
            Self::ReferenceNotFound { .. } => ErrorClass::NotFound,
            Self::InsufficientInventory { .. }
            | Self::DuplicateLine(_)
            | Self::TotalMismatch { .. } => ErrorClass::Conflict,
            Self::Timeout(_) => ErrorClass::Unavailable,
            Self::PersistenceFailure { .. } => ErrorClass::Internal,
        }
    }

    /// Whether the same request may succeed if sent again unchanged.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::InsufficientInventory { .. } | Self::PersistenceFailure { .. }
        )
    }
}

impl From<StoreError> for OrderError {
    /// Context-free translation. The coordinator refines `ProductNotFound`
    /// and friends with the ids it knows.
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::BuyerNotFound(id) => Self::ReferenceNotFound {
                kind: ReferenceKind::Buyer,
                id: id.into_inner(),
            },
            StoreError::ProductNotFound(id) => Self::ReferenceNotFound {
                kind: ReferenceKind::Product,
                id: id.into_inner(),
            },
            StoreError::OrderNotFound(id) => Self::ReferenceNotFound {
                kind: ReferenceKind::Order,
                id: id.into_inner(),
            },
            StoreError::DuplicateLine { product_id, .. } => Self::DuplicateLine(product_id),
            StoreError::StockUnderflow { .. } => Self::PersistenceFailure {
                operation: Operation::DecrementQuantity,
            },
            StoreError::LockContention { operation } | StoreError::StoreFailure { operation } => {
                Self::PersistenceFailure { operation }
            }
            StoreError::DuplicateIdempotencyKey(_) => Self::PersistenceFailure {
                operation: Operation::InsertOrderHeader,
            },
            StoreError::DuplicateUser { .. } => Self::PersistenceFailure {
                operation: Operation::WriteUser,
            },
        }
    }
}
